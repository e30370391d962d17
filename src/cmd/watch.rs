/*!
`watch.rs`

Implements the streaming subcommands:
  - watch-events (we) : cloud-to-device messages
  - watch-twin   (wt) : desired twin state updates

Both drain a `Subscription` with `consume`, printing every item as its own JSON
record (indented unless --compress), until the stream ends, errors, or the run is
cancelled.

Termination:
  - sink (output) failure  -> returned as-is, the subscription error is not consulted
  - stream end             -> the subscription's terminal error, if any
  - cancellation           -> `Error::Cancelled`, no further items are requested
*/

use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::{Session, Subscription, bootstrap};
use crate::utils::output::write_record;

/* ---- Subscription consumer ---- */

/// Feed every item of `sub` to `sink`, in order, one at a time.
pub async fn consume<T, F>(
    cancel: &CancellationToken,
    mut sub: Subscription<T>,
    mut sink: F,
) -> Result<()>
where
    F: AsyncFnMut(T) -> Result<()>,
{
    let mut delivered = 0usize;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(delivered, "subscription consumer cancelled");
                return Err(Error::Cancelled);
            }
            item = sub.next() => item,
        };
        let Some(item) = next else {
            break;
        };
        sink(item).await?;
        delivered += 1;
    }
    debug!(delivered, "subscription closed");
    match sub.take_err() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/* ---- Operations ---- */

pub async fn watch_events<W: AsyncWrite + Unpin + ?Sized>(
    session: &dyn Session,
    cancel: &CancellationToken,
    out: &mut W,
    compress: bool,
) -> Result<()> {
    let sub = session.subscribe_events().await?;
    consume(cancel, sub, async |msg| write_record(&mut *out, &msg, compress).await).await
}

pub async fn watch_twin<W: AsyncWrite + Unpin + ?Sized>(
    session: &dyn Session,
    cancel: &CancellationToken,
    out: &mut W,
    compress: bool,
) -> Result<()> {
    let sub = session.subscribe_twin_updates().await?;
    consume(cancel, sub, async |state| write_record(&mut *out, &state, compress).await).await
}

/* ---- Entry points ---- */

pub async fn execute_watch_events(config: &Config, cancel: &CancellationToken) -> Result<()> {
    let session = bootstrap::establish(config).await?;
    watch_events(&*session, cancel, &mut tokio::io::stdout(), config.compress).await
}

pub async fn execute_watch_twin(config: &Config, cancel: &CancellationToken) -> Result<()> {
    let session = bootstrap::establish(config).await?;
    watch_twin(&*session, cancel, &mut tokio::io::stdout(), config.compress).await
}
