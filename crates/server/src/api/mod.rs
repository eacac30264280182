pub mod admin;
pub mod coordinator;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod worker;

pub use routes::create_router;
