pub mod inspect;
pub mod process;

pub use inspect::inspect;
pub use process::process_image;
