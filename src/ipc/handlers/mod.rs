pub mod auth;
pub mod core;
pub mod exports;
pub mod history;
pub mod krs;
pub mod levels;
pub mod notifications;
pub mod students;
