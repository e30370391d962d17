/*!
`twin.rs`

Implements the twin subcommands:
  - twin-state  (ts) : print the current desired and reported state
  - update-twin (ut) : patch reported state from KEY VALUE pairs, print the new version

In update pairs the literal token `null` deletes the key; every other value is sent
as a string.
*/

use clap::Args;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::{Session, TwinState, Value, bootstrap};
use crate::utils::args::pairs_to_map;

/// Value token that removes a key from reported state.
pub const DELETE_TOKEN: &str = "null";

#[derive(Args, Debug)]
pub struct UpdateTwinArgs {
    /// Properties as alternating KEY VALUE arguments ("null" deletes the key)
    #[arg(required = true, num_args = 1.., value_name = "KEY VALUE")]
    pub pairs: Vec<String>,
}

/* ---- Codec ---- */

/// Turn `[k1, v1, k2, v2, ...]` into a twin update.
pub fn encode_update(tokens: &[String]) -> Result<TwinState> {
    Ok(pairs_to_map(tokens)?
        .into_iter()
        .map(|(k, v)| {
            let value = if v == DELETE_TOKEN {
                Value::delete_marker()
            } else {
                Value::String(v)
            };
            (k, value)
        })
        .collect())
}

/// Canonical single-line rendering of a twin document.
pub fn render_state(state: &TwinState) -> Result<String> {
    serde_json::to_string(state).map_err(|source| Error::Encode {
        what: "twin state",
        source,
    })
}

/* ---- Operations ---- */

async fn emit<W: AsyncWrite + Unpin + ?Sized>(out: &mut W, text: &str) -> Result<()> {
    out.write_all(text.as_bytes()).await.map_err(Error::Output)?;
    out.flush().await.map_err(Error::Output)
}

pub async fn twin_state<W: AsyncWrite + Unpin + ?Sized>(
    session: &dyn Session,
    out: &mut W,
) -> Result<()> {
    let (desired, reported) = session.retrieve_twin_state().await?;
    let desired = render_state(&desired)?;
    let reported = render_state(&reported)?;
    emit(out, &format!("desired:  {desired}\nreported: {reported}\n")).await
}

pub async fn update_twin<W: AsyncWrite + Unpin + ?Sized>(
    session: &dyn Session,
    update: TwinState,
    out: &mut W,
) -> Result<()> {
    let keys = update.len();
    let deletes = update.values().filter(|v| v.is_delete_marker()).count();
    let version = session.update_twin_state(update).await?;
    info!(keys, deletes, version, "reported state updated");
    emit(out, &format!("version: {version}\n")).await
}

/* ---- Entry points ---- */

pub async fn execute_twin_state(config: &Config) -> Result<()> {
    let session = bootstrap::establish(config).await?;
    twin_state(&*session, &mut tokio::io::stdout()).await
}

pub async fn execute_update_twin(args: UpdateTwinArgs, config: &Config) -> Result<()> {
    let update = encode_update(&args.pairs)?;
    let session = bootstrap::establish(config).await?;
    update_twin(&*session, update, &mut tokio::io::stdout()).await
}
