#[cfg(feature = "transport")]
pub use transport;
#[cfg(feature = "wire")]
pub use wire;
