// src/models/mod.rs

pub mod exam;
pub mod question;
pub mod score;
pub mod session;
