use crate::error::is_benign_disconnect;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_BUFFER: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the first stream to the second.
    AToB,
    /// From the second stream to the first.
    BToA,
}

#[derive(Debug)]
pub struct PipeOutcome {
    /// Direction whose copy ended the pipe.
    pub finished: Direction,
    pub a_to_b: u64,
    pub b_to_a: u64,
    /// Error that ended the finishing direction; `None` on a clean EOF.
    pub error: Option<io::Error>,
}

impl PipeOutcome {
    /// True for EOF and for teardown errors that every disconnect produces.
    pub fn is_clean(&self) -> bool {
        self.error.as_ref().is_none_or(is_benign_disconnect)
    }
}

/// Copies `a -> b` and `b -> a` until either direction stops, then drops both streams.
pub async fn pipe<A, B>(a: A, b: B) -> PipeOutcome
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    let (finished, result) = tokio::select! {
        r = copy_counted(&mut a_read, &mut b_write, &mut a_to_b) => (Direction::AToB, r),
        r = copy_counted(&mut b_read, &mut a_write, &mut b_to_a) => (Direction::BToA, r),
    };

    PipeOutcome {
        finished,
        a_to_b,
        b_to_a,
        error: result.err(),
    }
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, count: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.flush().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *count += n as u64;
    }
}
