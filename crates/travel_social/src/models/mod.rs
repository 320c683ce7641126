pub mod sessions;
pub mod user_follows;
pub mod users;
