//! Bidirectional byte pump shared by all forwarding modes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub const BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound on flushing and shutting down both writers after a relay ends.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    /// `a` reached EOF.
    AClosed,
    /// `b` reached EOF.
    BClosed,
    Error(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub end: RelayEnd,
}

/// Copies `a -> b` and `b -> a` until either side finishes or `cancel` fires,
/// then closes both streams.
///
/// There is no half-close: EOF in one direction tears down the other as well.
pub async fn relay<A, B>(a: A, b: B, cancel: &CancellationToken) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);

    let end = tokio::select! {
        _ = cancel.cancelled() => RelayEnd::Cancelled,
        result = pump(&mut a_read, &mut b_write, &a_to_b) => match result {
            Ok(()) => RelayEnd::AClosed,
            Err(e) => RelayEnd::Error(e.to_string()),
        },
        result = pump(&mut b_read, &mut a_write, &b_to_a) => match result {
            Ok(()) => RelayEnd::BClosed,
            Err(e) => RelayEnd::Error(e.to_string()),
        },
    };

    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = a_write.shutdown().await;
        let _ = b_write.shutdown().await;
    })
    .await;

    RelayStats {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
        end,
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
