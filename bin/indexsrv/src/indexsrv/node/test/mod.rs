pub mod mock;

mod mappings;
