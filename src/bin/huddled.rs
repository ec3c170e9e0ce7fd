//! Collaboration daemon: runs the room relay and the sync hub.
//!
//! The two servers listen on separate ports and share no state; either
//! one failing takes the process down so a supervisor can restart both.

use huddle_collab::relay::RelayServer;
use huddle_collab::sync::hub::SyncHub;

#[tokio::main]
async fn main() {
    env_logger::init();

    let relay = RelayServer::with_defaults();
    let hub = SyncHub::with_defaults();

    log::info!(
        "starting huddled: relay on {}, sync hub on {}",
        relay.bind_addr(),
        hub.bind_addr()
    );

    tokio::select! {
        result = relay.run() => {
            if let Err(e) = result {
                log::error!("relay exited: {e}");
                std::process::exit(1);
            }
        }
        result = hub.run() => {
            if let Err(e) = result {
                log::error!("sync hub exited: {e}");
                std::process::exit(1);
            }
        }
    }
}
