pub mod pg;
pub mod pool;

pub use pg::PgDirectory;
