/*!
Command dispatcher module.

One source file per operation; this file only declares the modules and re-exports
what `main.rs` needs.

Directory Layout:
  src/cmd/
    mod.rs          (this file)
    send.rs         (SendArgs         + execute_send)
    watch.rs        (subscription consumer + execute_watch_events / execute_watch_twin)
    method.rs       (DirectMethodArgs + execute_direct_method)
    twin.rs         (UpdateTwinArgs   + execute_twin_state / execute_update_twin)

Conventions:
  - Each subcommand exposes an async `execute_*` entry point taking the shared
    `Config` and returning `crate::error::Result<()>`.
  - Every entry point validates its own arguments before connecting, so usage and
    configuration errors never cost a network round trip.
  - The session is established inside the entry point and dropped when it returns.
*/

pub mod method;
pub mod send;
pub mod twin;
pub mod watch;

pub use method::{DirectMethodArgs, execute_direct_method};
pub use send::{SendArgs, execute_send};
pub use twin::{UpdateTwinArgs, execute_twin_state, execute_update_twin};
pub use watch::{execute_watch_events, execute_watch_twin};
