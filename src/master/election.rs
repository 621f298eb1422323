//! Leader election: race to create the ephemeral master-address node, park
//! on a watch while a primary holds it, and detect fresh-cluster startup.

use tokio::time::{self, Duration};

use crate::coord::{CoordClient, CoordEvent};
use crate::utils::RangemasterError;

/// What winning the election tells the new master.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ElectionOutcome {
    /// True iff the region-server directory was empty at the moment of
    /// winning: this master starts the cluster rather than adopting one.
    pub cluster_starter: bool,
}

/// Contends for the master lock, blocking until this process wins. A
/// process started with the backup flag first stalls `2 x session_timeout`
/// so a healthy primary is not preempted by a cold-boot race.
pub async fn elect(
    coord: &CoordClient,
    my_addr: &str,
    backup: bool,
    session_timeout: Duration,
) -> Result<ElectionOutcome, RangemasterError> {
    if backup {
        // ephemeral expiry can lag the session timeout; double it so a
        // healthy primary is never preempted on cold boot
        let stall = session_timeout * 2;
        pf_debug!("m"; "started in backup mode; stalling {:?} before \
                        contending...", stall);
        time::sleep(stall).await;
    }

    let master_path = coord.paths.master();
    let mut events = coord.session_events();
    loop {
        if coord
            .create_ephemeral(&master_path, my_addr.as_bytes())
            .await?
        {
            // won the race; fresh-cluster detection must happen before any
            // region server could have registered under the new master
            let cluster_starter = coord.scan_rs_dir().await?.is_empty();
            pf_info!("m"; "won master election as '{}' ({})", my_addr,
                     if cluster_starter { "cluster start" }
                     else { "failover" });
            return Ok(ElectionOutcome { cluster_starter });
        }

        // somebody else holds the lock; park until the node vanishes (with
        // a periodic re-check in case the deletion event was missed)
        pf_info!("m"; "another master is active; standing by...");
        coord.watch(&master_path).await?;
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(CoordEvent::NodeDeleted(path))
                            if path == master_path =>
                        {
                            break;
                        }
                        Ok(CoordEvent::SessionExpired) | Err(_) => {
                            return Err(RangemasterError::CoordUnavailable(
                                "session lost while standing by".into(),
                            ));
                        }
                        Ok(_) => {}
                    }
                },
                _ = time::sleep(session_timeout) => {
                    break; // re-check the lock defensively
                },
            }
        }
    }
}
