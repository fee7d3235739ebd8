use tokio_util::sync::CancellationToken;

use super::fetcher::PageviewFetcher;
use super::transport::Transport;

pub struct State<T: Transport> {
    pub fetcher: PageviewFetcher<T>,
    shutdown: CancellationToken,
}

impl<T: Transport> State<T> {
    pub fn new(fetcher: PageviewFetcher<T>, shutdown: CancellationToken) -> State<T> {
        tracing::info!("state initialized");
        State { fetcher, shutdown }
    }

    /// Token for one request; cancelled when the server shuts down.
    pub fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}
