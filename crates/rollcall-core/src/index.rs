//! Signature shortlist cache.
//!
//! Holds one [`Candidate`] per enrolled identity. Signatures and descriptors
//! are filled lazily and at most once per candidate; a cell is either empty
//! or fully computed, never partially written. Rebuilds are coalesced so at
//! most one `list_identities` call is in flight at any time. Computed
//! vectors survive rebuilds and invalidation for as long as the identity
//! stays enrolled.

use crate::config::IndexConfig;
use crate::error::{Fault, StoreError};
use crate::signature::Signature;
use crate::store::RecordStore;
use crate::types::{Descriptor, Identity, IdentityId};
use futures::future::{BoxFuture, FutureExt, Shared};
use image::DynamicImage;
use rollcall_capture::decode_image;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::OnceCell;

/// An enrolled identity with its lazily computed comparison vectors.
#[derive(Debug)]
pub struct Candidate {
    pub identity: Identity,
    /// `Some(None)` marks a reference image that could not be decoded.
    pub(crate) signature: OnceCell<Option<Signature>>,
    /// `Some(None)` marks a reference image with no detectable face.
    pub(crate) descriptor: OnceCell<Option<Descriptor>>,
}

impl Candidate {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            signature: OnceCell::new(),
            descriptor: OnceCell::new(),
        }
    }

    /// Carry already computed vectors over to an updated identity record.
    fn refreshed(&self, identity: Identity) -> Self {
        Self {
            identity,
            signature: OnceCell::new_with(self.signature.get().cloned()),
            descriptor: OnceCell::new_with(self.descriptor.get().cloned()),
        }
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.get().and_then(Option::as_ref)
    }

    pub fn descriptor(&self) -> Option<&Descriptor> {
        self.descriptor.get().and_then(Option::as_ref)
    }
}

pub type CandidateSet = Arc<Vec<Arc<Candidate>>>;

type BuildFuture = Shared<BoxFuture<'static, Result<CandidateSet, Fault>>>;

/// A shortlisted candidate and its signature similarity to the probe.
#[derive(Debug, Clone)]
pub struct ShortlistEntry {
    pub candidate: Arc<Candidate>,
    pub similarity: f32,
}

struct IndexState {
    cache: RwLock<Option<CandidateSet>>,
    /// Candidates dropped by `invalidate`, reused by the next build.
    retired: Mutex<Option<CandidateSet>>,
    /// The running build and the generation it was started in.
    in_flight: Mutex<Option<(u64, BuildFuture)>>,
    generation: AtomicU64,
    builds: AtomicUsize,
}

pub struct SignatureIndex {
    store: Arc<dyn RecordStore>,
    config: IndexConfig,
    state: Arc<IndexState>,
}

impl SignatureIndex {
    pub fn new(store: Arc<dyn RecordStore>, config: IndexConfig) -> Self {
        Self {
            store,
            config,
            state: Arc::new(IndexState {
                cache: RwLock::new(None),
                retired: Mutex::new(None),
                in_flight: Mutex::new(None),
                generation: AtomicU64::new(0),
                builds: AtomicUsize::new(0),
            }),
        }
    }

    /// Refresh the candidate set from the record store.
    ///
    /// Callers arriving while a build is in flight share its result instead
    /// of starting another one. Candidates for identities that are still
    /// enrolled keep their computed signature and descriptor.
    ///
    /// A build started before the last `invalidate` is not joined: it is
    /// awaited to completion and then a fresh one is started.
    pub async fn build(&self) -> Result<CandidateSet, Fault> {
        loop {
            let (current, build) = {
                let mut in_flight = self
                    .state
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let generation = self.state.generation.load(Ordering::SeqCst);
                match in_flight.as_ref() {
                    Some((started, build)) => (*started == generation, build.clone()),
                    None => {
                        let build = self.start_build(generation);
                        *in_flight = Some((generation, build.clone()));
                        (true, build)
                    }
                }
            };
            if current {
                return build.await;
            }
            tracing::debug!("waiting out a build started before invalidation");
            let _ = build.await;
        }
    }

    fn start_build(&self, generation: u64) -> BuildFuture {
        let store = Arc::clone(&self.store);
        let state = Arc::clone(&self.state);
        state.builds.fetch_add(1, Ordering::SeqCst);

        async move {
            let result = match store.list_identities().await {
                Ok(identities) => {
                    let mut cache = state.cache.write().unwrap_or_else(PoisonError::into_inner);
                    let mut retired = state.retired.lock().unwrap_or_else(PoisonError::into_inner);
                    let current = state.generation.load(Ordering::SeqCst) == generation;
                    let previous = cache
                        .clone()
                        .or_else(|| retired.clone())
                        .unwrap_or_default();
                    let set: CandidateSet = Arc::new(
                        identities
                            .into_iter()
                            .map(|identity| match previous.iter().find(|c| c.identity.id == identity.id) {
                                Some(old) if old.identity == identity => Arc::clone(old),
                                Some(old) => Arc::new(old.refreshed(identity)),
                                None => Arc::new(Candidate::new(identity)),
                            })
                            .collect(),
                    );
                    if current {
                        *cache = Some(Arc::clone(&set));
                        *retired = None;
                    }
                    tracing::info!(candidates = set.len(), "signature index built");
                    Ok(set)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "signature index build failed");
                    Err(Fault::store("list_identities", e))
                }
            };
            *state.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = None;
            result
        }
        .boxed()
        .shared()
    }

    /// The cached candidate set, building it first if the cache is empty.
    pub async fn candidates(&self) -> Result<CandidateSet, Fault> {
        let cached = self
            .state
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match cached {
            Some(set) => Ok(set),
            None => self.build().await,
        }
    }

    /// Rank every candidate by signature similarity to the probe and return
    /// the best `k`, most similar first. Equal similarities keep enrollment
    /// order. An empty population yields an empty shortlist.
    pub async fn shortlist(&self, probe: &DynamicImage, k: usize) -> Result<Vec<ShortlistEntry>, Fault> {
        let candidates = self.candidates().await?;
        if candidates.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let side = self.config.signature_side;
        let image = probe.clone();
        let probe_signature = tokio::task::spawn_blocking(move || Signature::from_image(&image, side))
            .await
            .map_err(|e| Fault::worker("probe_signature", e.to_string()))?;

        let mut ranked = Vec::with_capacity(candidates.len());
        for candidate in candidates.iter() {
            let Some(signature) = self.signature_for(candidate).await? else {
                continue;
            };
            ranked.push(ShortlistEntry {
                candidate: Arc::clone(candidate),
                similarity: probe_signature.similarity(signature),
            });
        }

        ranked.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(k);

        tracing::debug!(
            population = candidates.len(),
            shortlisted = ranked.len(),
            best = ranked.first().map(|e| e.similarity),
            "shortlist ranked"
        );
        Ok(ranked)
    }

    async fn signature_for<'a>(&self, candidate: &'a Candidate) -> Result<Option<&'a Signature>, Fault> {
        let side = self.config.signature_side;
        let cell = candidate
            .signature
            .get_or_try_init(|| async {
                let bytes = match self.store.get_reference_image(&candidate.identity).await {
                    Ok(bytes) => bytes,
                    Err(StoreError::ReferenceImageMissing(id)) => {
                        tracing::warn!(identity = %id, "reference image gone; skipping candidate");
                        return Ok(None);
                    }
                    Err(e) => return Err(Fault::store("get_reference_image", e)),
                };

                let computed = tokio::task::spawn_blocking(move || {
                    decode_image(&bytes).map(|image| Signature::from_image(&image, side))
                })
                .await;

                match computed {
                    Ok(Ok(signature)) => Ok(Some(signature)),
                    Ok(Err(e)) => {
                        tracing::warn!(
                            identity = %candidate.identity.id,
                            error = %e,
                            "undecodable reference image; candidate excluded"
                        );
                        Ok(None)
                    }
                    Err(e) => {
                        tracing::warn!(identity = %candidate.identity.id, error = %e, "signature worker failed");
                        Ok(None)
                    }
                }
            })
            .await?;
        Ok(cell.as_ref())
    }

    /// Drop the cache; the next call repopulates it from the store.
    ///
    /// Identities still enrolled at the next build keep their vectors.
    pub fn invalidate(&self) {
        let mut cache = self.state.cache.write().unwrap_or_else(PoisonError::into_inner);
        self.state.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(set) = cache.take() {
            *self.state.retired.lock().unwrap_or_else(PoisonError::into_inner) = Some(set);
        }
        tracing::debug!("signature index invalidated");
    }

    /// Evict one identity (and its cached descriptor) after removal.
    pub fn forget(&self, identity_id: IdentityId) {
        let mut cache = self.state.cache.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(set) = cache.as_ref() {
            let kept: Vec<_> = set
                .iter()
                .filter(|c| c.identity.id != identity_id)
                .cloned()
                .collect();
            *cache = Some(Arc::new(kept));
        }
    }

    /// Number of cached candidates, or `None` before the first build.
    pub fn len(&self) -> Option<usize> {
        self.state
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|set| set.len())
    }

    /// Total number of store-backed builds started.
    pub fn builds_started(&self) -> usize {
        self.state.builds.load(Ordering::SeqCst)
    }
}
