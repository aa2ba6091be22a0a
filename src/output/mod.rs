pub mod csv;
pub mod json;
pub mod plain;

pub use csv::output_csv;
pub use json::output_json;
pub use plain::output_plain;
