/*!
`send.rs`

Implements the `send` (s) subcommand: emit one device-to-cloud event.

  iothub-device send PAYLOAD [KEY VALUE]... [--mid ID] [--cid ID] [--qos 0|1]

Property pairs are validated before connecting; an odd number of them is a usage
error. Success prints nothing.
*/

use clap::{Args, ValueEnum};
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::session::{QoS, SendOptions, Session, bootstrap};
use crate::utils::args::pairs_to_map;

/// `--qos` values as typed on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosArg {
    /// At most once
    #[value(name = "0")]
    Zero,
    /// At least once
    #[value(name = "1")]
    One,
}

impl From<QosArg> for QoS {
    fn from(q: QosArg) -> Self {
        match q {
            QosArg::Zero => QoS::AtMostOnce,
            QosArg::One => QoS::AtLeastOnce,
        }
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Event payload
    #[arg(value_name = "PAYLOAD")]
    pub payload: String,

    /// Application properties as alternating KEY VALUE arguments
    #[arg(value_name = "KEY VALUE")]
    pub properties: Vec<String>,

    /// Message identifier
    #[arg(long = "mid", value_name = "ID", default_value = "")]
    pub message_id: String,

    /// Correlation identifier
    #[arg(long = "cid", value_name = "ID", default_value = "")]
    pub correlation_id: String,

    /// Quality of service
    #[arg(long, value_enum, default_value_t = QosArg::One)]
    pub qos: QosArg,
}

impl SendArgs {
    fn options(&self) -> Result<SendOptions> {
        Ok(SendOptions {
            properties: pairs_to_map(&self.properties)?,
            message_id: self.message_id.clone(),
            correlation_id: self.correlation_id.clone(),
            qos: self.qos.into(),
        })
    }
}

pub async fn send(session: &dyn Session, payload: &str, opts: SendOptions) -> Result<()> {
    let qos = opts.qos;
    session.send_event(payload.as_bytes().to_vec(), opts).await?;
    info!(bytes = payload.len(), ?qos, "event sent");
    Ok(())
}

pub async fn execute_send(args: SendArgs, config: &Config) -> Result<()> {
    let opts = args.options()?;
    let session = bootstrap::establish(config).await?;
    send(&*session, &args.payload, opts).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::session::testing::FakeSession;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: SendArgs,
    }

    fn parse(argv: &[&str]) -> SendArgs {
        Harness::try_parse_from(std::iter::once("send").chain(argv.iter().copied()))
            .unwrap()
            .args
    }

    #[tokio::test]
    async fn hello_with_one_property() {
        let args = parse(&["hello", "k", "v"]);
        let session = FakeSession::default();
        send(&session, &args.payload, args.options().unwrap())
            .await
            .unwrap();

        let sent = session.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (payload, opts) = &sent[0];
        assert_eq!(payload.as_slice(), b"hello");
        assert_eq!(opts.properties.len(), 1);
        assert_eq!(opts.properties["k"], "v");
        assert_eq!(opts.qos, QoS::AtLeastOnce);
        assert!(opts.message_id.is_empty());
        assert!(opts.correlation_id.is_empty());
    }

    #[test]
    fn flags_are_carried() {
        let args = parse(&["p", "--mid", "m1", "--cid", "c1", "--qos", "0"]);
        let opts = args.options().unwrap();
        assert_eq!(opts.message_id, "m1");
        assert_eq!(opts.correlation_id, "c1");
        assert_eq!(opts.qos, QoS::AtMostOnce);
    }

    #[test]
    fn qos_outside_range_is_rejected() {
        assert!(
            Harness::try_parse_from(["send", "p", "--qos", "2"]).is_err()
        );
    }

    #[test]
    fn dangling_property_key_is_usage_error() {
        let args = parse(&["hello", "k"]);
        assert!(matches!(args.options(), Err(Error::InvalidUsage(_))));
    }
}
