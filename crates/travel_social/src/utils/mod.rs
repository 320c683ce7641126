pub mod document_paths;
pub mod errors;
