pub mod app;
pub mod audit;
pub mod client;
pub mod conf;
pub mod server;
#[cfg(test)]
mod testing;
pub mod trigger;
pub mod warehouse;
