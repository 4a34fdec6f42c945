//! Plugin descriptions and the persistent known-plugins registry used by
//! Harmoniq Studio's plugin scanner.

mod description;
mod known_list;
mod tag_tree;

pub use description::*;
pub use known_list::*;
pub use tag_tree::*;
