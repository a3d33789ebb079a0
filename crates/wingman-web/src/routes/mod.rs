// Route handler modules

pub mod downloads;
pub mod health;
pub mod inference;
pub mod models;
pub mod services;
pub mod status;
