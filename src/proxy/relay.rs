//! Bidirectional byte relay between two established streams.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::debug;

/// Bytes moved in each direction. `None` for a direction that was still
/// running when the other one ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: Option<u64>,
    pub b_to_a: Option<u64>,
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Copy `a` to `b` and `b` to `a` until either direction reaches EOF or
/// fails. Both streams are dropped, and so closed, before this returns.
pub async fn relay<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut upstream = AbortOnDrop(tokio::spawn(async move {
        let result = tokio::io::copy(&mut a_read, &mut b_write).await;
        let _ = b_write.shutdown().await;
        result
    }));

    let downstream = async move {
        let result = tokio::io::copy(&mut b_read, &mut a_write).await;
        let _ = a_write.shutdown().await;
        result
    };

    let stats = tokio::select! {
        joined = &mut upstream.0 => {
            let copied = match joined {
                Ok(Ok(n)) => Some(n),
                Ok(Err(error)) => {
                    debug!(error = ?error.to_string(), "relay_a_to_b_failed");
                    None
                }
                Err(_) => None,
            };
            RelayStats { a_to_b: copied, b_to_a: None }
        }
        copied = downstream => {
            let copied = match copied {
                Ok(n) => Some(n),
                Err(error) => {
                    debug!(error = ?error.to_string(), "relay_b_to_a_failed");
                    None
                }
            };
            RelayStats { a_to_b: None, b_to_a: copied }
        }
    };

    // Dropping the guard aborts the other copy; the aborted task drops its
    // halves once the runtime polls it.
    drop(upstream);
    stats
}
