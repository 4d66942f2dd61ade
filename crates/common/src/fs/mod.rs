mod clear_dir;
mod ensure_file;

pub use clear_dir::*;
pub use ensure_file::*;
