pub mod backend;
pub mod controller;
pub mod session;
pub mod types;
pub mod window;
