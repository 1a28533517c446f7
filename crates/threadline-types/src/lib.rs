//! Wire and model types shared by the threadline sync engine and its tools.

pub mod api;
pub mod events;
pub mod models;
