pub mod codec;
pub mod hash;
pub mod params;
pub mod script;
pub mod types;
