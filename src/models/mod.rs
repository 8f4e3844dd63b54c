pub mod health;
pub mod probe;
pub mod proxy;
pub mod settings;

pub use health::*;
pub use probe::*;
pub use proxy::*;
pub use settings::*;
