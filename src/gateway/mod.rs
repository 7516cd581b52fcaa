pub mod server;
pub mod stream;

pub use server::{AppState, app, run};
pub use stream::{ScopedEventStream, StreamFrame};
