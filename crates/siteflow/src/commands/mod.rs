pub mod apply;
pub mod destroy;
pub mod drift;
pub mod plan;
pub mod state;
pub mod validate;
