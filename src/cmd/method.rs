/*!
`method.rs`

Implements the `direct-method` (dm) subcommand: serve one named direct method from
operator input.

Flow per invocation (serialized by one lock over operator input/output, since the
session may call the handler concurrently for overlapping invocations):
  1. encode the request payload as JSON
  2. print it, either bare (--quiet) or as
        Payload: {...}
        Enter json response:
  3. read one line from the operator
  4. parse it as a JSON object (or `null`, meaning an empty one) and answer the
     invocation with it

Failures:
  - encode / read failure  : the invocation is answered with the error AND the
                             command terminates with the same error
  - parse failure          : the invocation is answered with "unable to parse input",
                             the command terminates with the underlying parse error

The command itself has no success exit: it answers invocations until the first fatal
error (only the first is kept; later ones are logged and dropped), the session is
lost, or the run is cancelled.
*/

use std::io;
use std::sync::Arc;

use clap::Args;
use futures::FutureExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::{
    InvocationError, MethodHandler, Payload, Session, SessionError, bootstrap,
};

/// What the remote caller is told when the operator's response is not valid JSON.
pub const PARSE_FAILURE: &str = "unable to parse input";

/* ---- Argument Struct ---- */

#[derive(Args, Debug)]
pub struct DirectMethodArgs {
    /// Name of the direct method to handle
    #[arg(value_name = "NAME")]
    pub name: String,

    /// Disable additional hints (print bare payloads)
    #[arg(long, visible_alias = "quite")]
    pub quiet: bool,
}

/* ---- Responder ---- */

struct OperatorIo<R, W> {
    input: R,
    output: W,
}

/// Answers invocations from operator input, one at a time.
struct Responder<R, W> {
    io: Mutex<OperatorIo<R, W>>,
    quiet: bool,
    fatal: mpsc::Sender<Error>,
}

impl<R, W> Responder<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Post a fatal error; the first one wins.
    fn terminate(&self, err: Error) {
        if let Err(e) = self.fatal.try_send(err) {
            debug!(error = %e.into_inner(), "termination already pending, dropping error");
        }
    }

    /// Terminate with `err` and answer the caller with the same message.
    fn fail(&self, err: Error) -> InvocationError {
        let answer = InvocationError::new(err.to_string());
        self.terminate(err);
        answer
    }

    async fn respond(&self, payload: Payload) -> Result<Payload, InvocationError> {
        let mut guard = self.io.lock().await;
        let OperatorIo { input, output } = &mut *guard;

        let encoded = match serde_json::to_string(&payload) {
            Ok(s) => s,
            Err(source) => {
                return Err(self.fail(Error::Encode {
                    what: "payload",
                    source,
                }));
            }
        };

        let prompt = if self.quiet {
            format!("{encoded}\n")
        } else {
            format!("Payload: {encoded}\nEnter json response: ")
        };
        let written = async {
            output.write_all(prompt.as_bytes()).await?;
            output.flush().await
        };
        if let Err(e) = written.await {
            return Err(self.fail(Error::Output(e)));
        }

        let mut line = String::new();
        match input.read_line(&mut line).await {
            Ok(0) => {
                let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "end of input");
                return Err(self.fail(Error::Input(eof)));
            }
            Ok(_) => {}
            Err(e) => return Err(self.fail(Error::Input(e))),
        }

        match serde_json::from_str::<Option<Payload>>(line.trim_end()) {
            Ok(response) => Ok(response.unwrap_or_default()),
            Err(e) => {
                warn!(error = %e, "operator response is not a json object");
                self.terminate(Error::ParseResponse(e));
                Err(InvocationError::new(PARSE_FAILURE))
            }
        }
    }
}

/* ---- Bridge ---- */

/// Register `name` on `session` and answer invocations from `input` / `output`
/// until the first fatal error, session loss or cancellation.
pub async fn serve_method<R, W>(
    session: &dyn Session,
    name: &str,
    input: R,
    output: W,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (fatal, mut terminated) = mpsc::channel(1);
    let responder = Arc::new(Responder {
        io: Mutex::new(OperatorIo { input, output }),
        quiet,
        fatal,
    });

    let handler: MethodHandler = Arc::new(move |payload: Payload| {
        let responder = Arc::clone(&responder);
        async move { responder.respond(payload).await }.boxed()
    });
    session.register_method(name, handler).await?;
    info!(method = name, "waiting for invocations");

    tokio::select! {
        err = terminated.recv() => Err(err.unwrap_or(Error::Session(SessionError::Closed))),
        err = session.closed() => Err(err.into()),
        () = cancel.cancelled() => Err(Error::Cancelled),
    }
}

/* ---- Entry point ---- */

pub async fn execute_direct_method(
    args: DirectMethodArgs,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<()> {
    let session = bootstrap::establish(config).await?;
    serve_method(
        &*session,
        &args.name,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        args.quiet,
        cancel,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Value;
    use crate::session::testing::{FakeSession, IoLog, RecordingOutput, ScriptedInput};

    fn payload(key: &str, value: &str) -> Payload {
        let mut p = Payload::new();
        p.insert(key.into(), Value::from(value));
        p
    }

    fn operator(lines: &[&str]) -> (BufReader<ScriptedInput>, RecordingOutput, IoLog) {
        let log = IoLog::default();
        (
            BufReader::new(ScriptedInput::new(lines, log.clone())),
            RecordingOutput::new(log.clone()),
            log,
        )
    }

    #[tokio::test]
    async fn answers_until_parse_failure() {
        let session = FakeSession::default();
        let (input, output, log) = operator(&[r#"{"ok":true}"#, "not json"]);
        let cancel = CancellationToken::new();

        let serve = serve_method(&session, "reboot", input, output, false, &cancel);
        let drive = async {
            let handler = session.handler("reboot").await;
            let first = handler(payload("delay", "5")).await;
            let second = handler(payload("delay", "6")).await;
            (first, second)
        };
        let (served, (first, second)) = tokio::join!(serve, drive);

        let mut expected = Payload::new();
        expected.insert("ok".into(), Value::Bool(true));
        assert_eq!(first.unwrap(), expected);

        let remote = second.unwrap_err();
        assert_eq!(remote.message(), PARSE_FAILURE);

        let fatal = served.unwrap_err();
        assert!(matches!(fatal, Error::ParseResponse(_)), "got {fatal:?}");
        assert_ne!(fatal.to_string(), remote.message());

        let written = RecordingOutput::written(&log);
        assert!(written.starts_with("Payload: {\"delay\":\"5\"}\nEnter json response: "));
        assert!(written.contains("Payload: {\"delay\":\"6\"}"));
    }

    #[tokio::test]
    async fn quiet_mode_prints_bare_payload() {
        let session = FakeSession::default();
        let (input, output, log) = operator(&["{}"]);
        let cancel = CancellationToken::new();

        let serve = serve_method(&session, "m", input, output, true, &cancel);
        let drive = async {
            let handler = session.handler("m").await;
            let answered = handler(payload("a", "b")).await;
            // No more input: the next read hits end of input.
            let eof = handler(Payload::new()).await;
            (answered, eof)
        };
        let (served, (answered, eof)) = tokio::join!(serve, drive);

        assert_eq!(answered.unwrap(), Payload::new());
        assert!(eof.is_err());
        assert!(matches!(served, Err(Error::Input(_))));
        assert_eq!(RecordingOutput::written(&log), "{\"a\":\"b\"}\n{}\n");
    }

    #[tokio::test]
    async fn null_response_is_an_empty_answer() {
        let session = FakeSession::default();
        let (input, output, _log) = operator(&["null", "{}"]);
        let cancel = CancellationToken::new();

        let serve = serve_method(&session, "m", input, output, true, &cancel);
        let drive = async {
            let handler = session.handler("m").await;
            let first = handler(payload("a", "b")).await;
            let second = handler(Payload::new()).await;
            cancel.cancel();
            (first, second)
        };
        let (served, (first, second)) = tokio::join!(serve, drive);

        assert_eq!(first.unwrap(), Payload::new());
        assert_eq!(second.unwrap(), Payload::new());
        assert!(matches!(served, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn lost_session_ends_the_wait() {
        let session = FakeSession::default();
        let (input, output, _log) = operator(&[]);
        let cancel = CancellationToken::new();

        let serve = serve_method(&session, "m", input, output, false, &cancel);
        let drop_connection = async {
            session.handler("m").await;
            session.lost.cancel();
        };
        let (served, ()) = tokio::join!(serve, drop_connection);

        assert!(matches!(
            served,
            Err(Error::Session(SessionError::ConnectionLost(_)))
        ));
    }

    #[tokio::test]
    async fn read_failure_answers_and_terminates_with_same_error() {
        let session = FakeSession::default();
        let (input, output, _log) = operator(&[]);
        let cancel = CancellationToken::new();

        let serve = serve_method(&session, "m", input, output, false, &cancel);
        let drive = async {
            let handler = session.handler("m").await;
            handler(Payload::new()).await
        };
        let (served, answered) = tokio::join!(serve, drive);

        let fatal = served.unwrap_err();
        assert!(matches!(fatal, Error::Input(_)));
        assert_eq!(answered.unwrap_err().message(), fatal.to_string());
    }

    #[tokio::test]
    async fn registration_failure_returns_immediately() {
        let session = FakeSession::default();
        *session.register_error.lock().unwrap() =
            Some(SessionError::DuplicateMethod("m".into()));
        let (input, output, _log) = operator(&[]);

        let err = serve_method(&session, "m", input, output, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Session(SessionError::DuplicateMethod(_))
        ));
    }

    #[tokio::test]
    async fn cancellation_ends_the_wait() {
        let session = FakeSession::default();
        let (input, output, _log) = operator(&[]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = serve_method(&session, "m", input, output, false, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(session.methods.lock().unwrap().contains_key("m"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_invocations_do_not_interleave() {
        let session = Arc::new(FakeSession::default());
        let (input, output, log) = operator(&["{\"n\":1}", "{\"n\":2}", "{\"n\":3}"]);
        let cancel = CancellationToken::new();

        let serving = {
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                serve_method(&*session, "m", input, output, false, &cancel).await
            })
        };

        let handler = session.handler("m").await;
        let calls: Vec<_> = (0..3)
            .map(|i| {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { handler(payload("call", &i.to_string())).await })
            })
            .collect();
        for call in calls {
            assert!(call.await.unwrap().is_ok());
        }
        cancel.cancel();
        assert!(matches!(serving.await.unwrap(), Err(Error::Cancelled)));

        // Each prompt is immediately followed by its own read.
        let events = log.lock().unwrap().clone();
        assert_eq!(events.len(), 6);
        for pair in events.chunks(2) {
            assert!(pair[0].starts_with("write:Payload: "), "{events:?}");
            assert!(pair[1].starts_with("read:"), "{events:?}");
        }
    }
}
