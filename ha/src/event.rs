//! Lease change notifications, narrowed to the two objects of one group.

use crate::{
    error::Result,
    record::{RecordKeys, Switchover, LEADER},
    storage::{ObjectEvent, ObjectStore},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEvent {
    /// The leader object was created, changed or removed. `leader` is the
    /// holder named by the new version, if any.
    LeaderChanged {
        old_version: Option<String>,
        new_version: Option<String>,
        leader: Option<String>,
    },
    SwitchoverRequested { candidate: String },
    SwitchoverCleared,
}

/// Maps a raw store event to a lease event, ignoring foreign objects.
pub fn classify(keys: &RecordKeys, event: &ObjectEvent) -> Option<LeaseEvent> {
    let name = event.name();
    if name == keys.leader() {
        let (old_version, new) = match event {
            ObjectEvent::Added(obj) => (None, Some(obj)),
            ObjectEvent::Updated { old, new } => (Some(old.version.clone()), Some(new)),
            ObjectEvent::Deleted(obj) => (Some(obj.version.clone()), None),
        };
        return Some(LeaseEvent::LeaderChanged {
            old_version,
            new_version: new.map(|obj| obj.version.clone()),
            leader: new
                .and_then(|obj| obj.data.get(LEADER))
                .filter(|name| !name.is_empty())
                .cloned(),
        });
    }

    if name == keys.switchover() {
        return Some(match event {
            ObjectEvent::Added(obj) | ObjectEvent::Updated { new: obj, .. } => {
                match Switchover::from_annotations(&obj.data) {
                    Ok(switchover) => LeaseEvent::SwitchoverRequested {
                        candidate: switchover.candidate,
                    },
                    Err(e) => {
                        warn!(object = %obj.name, error = %e, "Unreadable switchover marker");
                        LeaseEvent::SwitchoverRequested {
                            candidate: String::new(),
                        }
                    }
                }
            }
            ObjectEvent::Deleted(_) => LeaseEvent::SwitchoverCleared,
        });
    }

    None
}

/// Subscribes to the group's objects and forwards typed events until the
/// receiver is dropped or the store closes the stream.
pub async fn watch_lease(
    objects: Arc<dyn ObjectStore>,
    keys: RecordKeys,
) -> Result<mpsc::UnboundedReceiver<LeaseEvent>> {
    let mut raw = objects.watch(vec![keys.leader(), keys.switchover()]).await?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(event) = raw.recv().await {
            if let Some(lease_event) = classify(&keys, &event) {
                if tx.send(lease_event).is_err() {
                    break;
                }
            }
        }
        debug!(group = %keys.prefix(), "Lease watch finished");
    });

    Ok(rx)
}
