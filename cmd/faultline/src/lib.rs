pub mod cli;
pub mod collector;
pub mod error;
pub mod initializers;
pub mod io;
pub mod selfcheck;
