pub mod commands;
pub mod connection;
pub mod decode;
pub mod driver;
pub mod engine;
pub mod modbus;
pub mod output;
pub mod plan;

#[cfg(test)]
mod testing;
