//! Modbus/TCP collection plane: frame codec, session and device pool.

pub mod connection;
pub mod frame;
pub mod pool;

pub use connection::{ConnectionState, ModbusConnection};
pub use pool::ModbusDevicePool;
