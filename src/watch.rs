use futures::{Stream, StreamExt};
use kube::api::Api;
use kube::runtime::{watcher, watcher::Event, WatchStreamExt};
use kube::{Client, ResourceExt};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::predicate::{tags_changed, RepositoryEvent};
use crate::reconcile::Reconciler;
use crate::resources::ImageRepository;

/// Delay before a failed reconciliation is fed back into the queue.
const REQUEUE_DELAY: Duration = Duration::from_secs(30);

/// Stable identity of a watched repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn key_of(repo: &ImageRepository) -> Option<ObjectKey> {
    let namespace = repo.namespace()?;
    Some(ObjectKey {
        namespace,
        name: repo.name_any(),
    })
}

fn admitted_key(event: &RepositoryEvent) -> Option<ObjectKey> {
    match event {
        RepositoryEvent::Created(repo) => key_of(repo),
        RepositoryEvent::Updated { new, .. } => key_of(new),
        RepositoryEvent::Deleted(repo) => key_of(repo),
    }
}

/// Turns raw watch events into lifecycle events carrying old/new snapshots.
///
/// Relist events (`Init*`) reuse existing snapshots, so a watch restart only
/// refires repositories whose revision actually changed while the watch was
/// down. Snapshots whose object does not reappear during the relist are
/// dropped on `InitDone`: the object was deleted while the watch was down,
/// and a later recreate must fire as a create, not as an unchanged update.
#[derive(Default)]
struct EventSynthesizer {
    snapshots: HashMap<ObjectKey, ImageRepository>,
    relisted: Option<HashSet<ObjectKey>>,
}

impl EventSynthesizer {
    fn observe(&mut self, event: Event<ImageRepository>) -> Option<RepositoryEvent> {
        match event {
            Event::Init => {
                self.relisted = Some(HashSet::new());
                None
            }
            Event::InitApply(repo) => {
                if let (Some(relisted), Some(key)) = (self.relisted.as_mut(), key_of(&repo)) {
                    relisted.insert(key);
                }
                self.apply(repo)
            }
            Event::InitDone => {
                if let Some(relisted) = self.relisted.take() {
                    self.snapshots.retain(|key, _| relisted.contains(key));
                }
                None
            }
            Event::Apply(repo) => self.apply(repo),
            Event::Delete(repo) => {
                let key = key_of(&repo)?;
                self.snapshots.remove(&key);
                Some(RepositoryEvent::Deleted(repo))
            }
        }
    }

    fn apply(&mut self, repo: ImageRepository) -> Option<RepositoryEvent> {
        let Some(key) = key_of(&repo) else {
            // Objects without an identity cannot be reconciled later.
            debug!("Ignoring watch object without namespace/name");
            return None;
        };
        match self.snapshots.insert(key, repo.clone()) {
            Some(old) => Some(RepositoryEvent::Updated { old, new: repo }),
            None => Some(RepositoryEvent::Created(repo)),
        }
    }
}

enum DispatchMsg {
    Enqueue(ObjectKey),
    Done { key: ObjectKey, failed: bool },
}

/// Bounded admission of reconcile tasks.
///
/// At most `workers` reconciliations run concurrently (the semaphore), and a
/// key is never admitted while a reconcile for it is in flight; a change
/// observed meanwhile is coalesced into one follow-up run.
struct Dispatcher {
    reconciler: Arc<Reconciler>,
    permits: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<DispatchMsg>,
    requeue_delay: Duration,
    busy: HashSet<ObjectKey>,
    pending: HashSet<ObjectKey>,
}

impl Dispatcher {
    fn new(
        reconciler: Arc<Reconciler>,
        workers: usize,
        requeue_delay: Duration,
        tx: mpsc::UnboundedSender<DispatchMsg>,
    ) -> Self {
        Self {
            reconciler,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tx,
            requeue_delay,
            busy: HashSet::new(),
            pending: HashSet::new(),
        }
    }

    fn enqueue(&mut self, key: ObjectKey) {
        if self.busy.contains(&key) {
            self.pending.insert(key);
            return;
        }
        self.busy.insert(key.clone());

        let reconciler = Arc::clone(&self.reconciler);
        let permits = Arc::clone(&self.permits);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let failed = match reconciler.reconcile(&key.namespace, &key.name).await {
                Ok(()) => false,
                Err(err) => {
                    error!("Reconcile of {} failed: {}", key, err);
                    true
                }
            };
            let _ = tx.send(DispatchMsg::Done { key, failed });
        });
    }

    fn complete(&mut self, key: ObjectKey, failed: bool) {
        self.busy.remove(&key);

        if failed {
            warn!(
                "Requeueing {} in {:?} after failed reconcile",
                key, self.requeue_delay
            );
            let tx = self.tx.clone();
            let delay = self.requeue_delay;
            let requeue = key.clone();
            // The timer task holds only a sender clone; a requeue that fires
            // after the event loop has exited is dropped.
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(DispatchMsg::Enqueue(requeue));
            });
        }

        if self.pending.remove(&key) {
            self.enqueue(key);
        }
    }

    fn idle(&self) -> bool {
        self.busy.is_empty() && self.pending.is_empty()
    }
}

/// Watch all ImageRepository objects and reconcile admitted changes until the
/// process is shut down.
pub async fn run(client: Client, reconciler: Arc<Reconciler>, workers: usize) -> anyhow::Result<()> {
    let api: Api<ImageRepository> = Api::all(client);
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    run_with_stream(stream, reconciler, workers, REQUEUE_DELAY).await;
    Ok(())
}

/// Event loop over an arbitrary watch stream. Returns once the stream ends
/// and all in-flight reconciles have drained; the production watcher stream
/// never ends.
async fn run_with_stream(
    stream: impl Stream<Item = Result<Event<ImageRepository>, watcher::Error>> + Send,
    reconciler: Arc<Reconciler>,
    workers: usize,
    requeue_delay: Duration,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut dispatcher = Dispatcher::new(reconciler, workers, requeue_delay, tx);
    let mut synthesizer = EventSynthesizer::default();
    let mut stream = pin!(stream);
    let mut stream_done = false;

    loop {
        tokio::select! {
            item = stream.next(), if !stream_done => {
                match item {
                    Some(Ok(event)) => {
                        if let Some(lifecycle) = synthesizer.observe(event) {
                            if tags_changed(&lifecycle) {
                                if let Some(key) = admitted_key(&lifecycle) {
                                    info!("Tag change detected for {}", key);
                                    dispatcher.enqueue(key);
                                }
                            }
                        }
                    }
                    Some(Err(err)) => warn!("Watch stream error: {}", err),
                    None => stream_done = true,
                }
            }
            Some(msg) = rx.recv() => {
                match msg {
                    DispatchMsg::Enqueue(key) => dispatcher.enqueue(key),
                    DispatchMsg::Done { key, failed } => dispatcher.complete(key, failed),
                }
            }
            else => break,
        }

        if stream_done && dispatcher.idle() {
            break;
        }
    }
}
