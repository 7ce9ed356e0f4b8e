use std::sync::Arc;

use uuid::Uuid;

use ojc_engine::store::Store;

/// First CTRL+C requests a cooperative pause of the running task; a second
/// one exits immediately.
pub fn spawn_ctrl_c_pause(store: Arc<dyn Store>, task_id: Uuid) {
    tokio::spawn(async move {
        let mut requests: u8 = 0;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            requests = requests.saturating_add(1);
            if requests == 1 {
                eprintln!(
                    "Pause requested — finishing the in-flight probe before stopping (press CTRL+C again to exit immediately)."
                );
                if let Err(err) = store.request_pause(task_id) {
                    tracing::warn!(task = %task_id, error = %err, "pause request rejected");
                }
            } else {
                std::process::exit(130);
            }
        }
    });
}
