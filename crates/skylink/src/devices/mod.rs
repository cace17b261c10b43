//! Devices shipped with the crate.

mod function;
mod literal;
mod remote;
mod temp;

pub use function::FunctionDevice;
pub use literal::LiteralDevice;
pub use remote::RemoteDevice;
pub use temp::TempDevice;
