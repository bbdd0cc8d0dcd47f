// Copyright 2025 Helsing GmbH
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Parallel dependency resolution.
//!
//! A pool of workers consumes a shared work queue seeded with the
//! project's declared dependencies. Each worker walks one constraint
//! through classification, version selection, the hoist-or-nest
//! placement decision, archive acquisition and extraction, then
//! enqueues the children it discovered. The pool terminates when the
//! queue is drained and no worker is in flight.
//!
//! Shared state is guarded by a single mutex taken for short critical
//! sections only, never across I/O. Manifest fetches and artifact work
//! are serialized by identity-keyed locks inside the respective stores.
//! The first non-optional failure wins an error mailbox and raises a
//! cancellation flag every worker observes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::errors::Error;
use crate::lock::{LockEntry, Lockfile};
use crate::manifest::{DependencyKind, Manifest};
use crate::package::{PackageName, PackageStore};
use crate::registry::{GitHub, RegistryClient, SourceRef, VersionMetadata};
use crate::solver;
use crate::workspace::WorkspaceSet;

/// A top-level unit of work for the resolver.
#[derive(Debug, Clone)]
pub struct Seed {
    pub name: String,
    pub spec: String,
    pub dev: bool,
    pub optional: bool,
    pub peer: bool,
}

impl Seed {
    pub fn new(name: impl Into<String>, spec: impl Into<String>, kind: DependencyKind) -> Self {
        Self {
            name: name.into(),
            spec: spec.into(),
            dev: matches!(kind, DependencyKind::Dev),
            optional: matches!(kind, DependencyKind::Optional),
            peer: matches!(kind, DependencyKind::Peer),
        }
    }
}

/// One constraint to resolve: a (name, spec) pair plus the placement
/// path of the package that requested it.
#[derive(Debug, Clone)]
struct Request {
    name: String,
    spec: String,
    parent: Option<String>,
    dev: bool,
    optional: bool,
    peer: bool,
}

/// How a constraint is satisfied, decided before any network work.
/// Workspace hits are matched upstream of classification.
enum Classified {
    Alias { effective: String, range: String },
    SourceControl(SourceRef),
    Registry { range: String },
}

fn classify(spec: &str) -> Classified {
    if let Some(rest) = spec.strip_prefix("npm:") {
        // The alias target itself may be scoped, so split on the last
        // `@` that is not the scope marker.
        let (effective, range) = if rest.len() > 1 {
            match rest[1..].rfind('@') {
                Some(at) => (&rest[..at + 1], &rest[at + 2..]),
                None => (rest, ""),
            }
        } else {
            (rest, "")
        };
        return Classified::Alias {
            effective: effective.to_owned(),
            range: range.to_owned(),
        };
    }

    if let Some(source) = SourceRef::parse(spec) {
        return Classified::SourceControl(source);
    }

    Classified::Registry {
        range: spec.to_owned(),
    }
}

/// Host platform, in the registry's naming scheme.
#[derive(Debug, Clone)]
pub struct Platform {
    pub os: String,
    pub cpu: String,
}

impl Platform {
    pub fn host() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            "windows" => "win32",
            other => other,
        };
        let cpu = match std::env::consts::ARCH {
            "x86_64" => "x64",
            "aarch64" => "arm64",
            "x86" => "ia32",
            other => other,
        };

        Self {
            os: os.to_owned(),
            cpu: cpu.to_owned(),
        }
    }
}

/// Whether a platform constraint list admits `host`. Lists may mix
/// plain and negated (`!darwin`) entries; an empty list admits all.
fn platform_allows(list: &[String], host: &str) -> bool {
    if list.is_empty() {
        return true;
    }

    // A list of only negations admits everything it does not name.
    let mut allowed = !list.iter().any(|entry| !entry.starts_with('!'));

    for entry in list {
        match entry.strip_prefix('!') {
            Some(negated) if negated == host => return false,
            Some(_) => {}
            None if entry == host => allowed = true,
            None => {}
        }
    }

    allowed
}

/// The work queue: FIFO plus the active-worker counter that makes the
/// termination condition (`queue empty ∧ active == 0`) race-free.
struct WorkQueue {
    queue: Mutex<VecDeque<Request>>,
    notify: Notify,
    active: AtomicUsize,
    cancelled: AtomicBool,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            active: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    fn push(&self, request: Request) {
        self.queue.lock().expect("queue poisoned").push_back(request);
        self.notify.notify_waiters();
    }

    /// Pops the next request, or waits until one arrives. Returns `None`
    /// once the queue is drained with no worker in flight, or when
    /// cancellation was signalled.
    async fn next(&self) -> Option<Request> {
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return None;
            }

            // Register interest before checking, so a notification
            // between the check and the await is not lost.
            let notified = self.notify.notified();

            {
                let mut queue = self.queue.lock().expect("queue poisoned");
                if let Some(request) = queue.pop_front() {
                    self.active.fetch_add(1, Ordering::SeqCst);
                    return Some(request);
                }
                if self.active.load(Ordering::SeqCst) == 0 {
                    self.notify.notify_waiters();
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks the previously popped request as finished.
    fn done(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Where a name currently sits in the tree.
#[derive(Debug, Clone)]
struct Hoisted {
    version: String,
    path: String,
}

/// Mutable resolver state: the processed-keys set, the hoisting map and
/// the lock-in-progress. One writable authority, guarded by the state
/// mutex, never held across I/O.
#[derive(Default)]
struct State {
    processed: HashSet<String>,
    hoisted: HashMap<String, Hoisted>,
    reserved: HashSet<String>,
    lock: Lockfile,
}

enum Placement {
    /// Already processed here, or an existing resolution satisfies the
    /// constraint.
    Skip,
    New {
        path: String,
    },
}

impl State {
    fn place(&mut self, name: &str, version: &str, spec: &str, parent: Option<&str>) -> Placement {
        if let Some(hoisted) = self.hoisted.get(name) {
            if hoisted.version == version || solver::satisfies(&hoisted.version, spec) {
                return Placement::Skip;
            }

            let Some(parent_path) = parent else {
                // Root slots are reserved for declared names up front,
                // so a conflicting top-level request cannot arise.
                return Placement::Skip;
            };

            let path = format!("{parent_path}/node_modules/{name}");
            let key = format!("{path}@{version}");
            if !self.processed.insert(key) {
                return Placement::Skip;
            }

            return Placement::New { path };
        }

        // The root slot of every manifest-declared name is reserved;
        // a transitive dependency of the same name nests instead.
        if parent.is_some() && self.reserved.contains(name) {
            let parent_path = parent.expect("transitive request carries a parent");
            let path = format!("{parent_path}/node_modules/{name}");
            let key = format!("{path}@{version}");
            if !self.processed.insert(key) {
                return Placement::Skip;
            }

            return Placement::New { path };
        }

        let key = format!("{name}@{version}");
        if !self.processed.insert(key) {
            return Placement::Skip;
        }

        let path = format!("node_modules/{name}");
        self.hoisted.insert(
            name.to_owned(),
            Hoisted {
                version: version.to_owned(),
                path: path.clone(),
            },
        );

        Placement::New { path }
    }
}

/// The parallel graph walker producing the lock's packages map.
pub struct Resolver {
    registry: Arc<RegistryClient>,
    github: Arc<GitHub>,
    store: Arc<PackageStore>,
    workspaces: Arc<WorkspaceSet>,
    platform: Platform,
    workers: usize,
    queue: WorkQueue,
    state: Mutex<State>,
    first_error: Mutex<Option<Error>>,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(16)
}

impl Resolver {
    pub fn new(
        registry: Arc<RegistryClient>,
        github: Arc<GitHub>,
        store: Arc<PackageStore>,
        workspaces: Arc<WorkspaceSet>,
    ) -> Self {
        Self {
            registry,
            github,
            store,
            workspaces,
            platform: Platform::host(),
            workers: default_workers(),
            queue: WorkQueue::new(),
            state: Mutex::new(State::default()),
            first_error: Mutex::new(None),
        }
    }

    /// Overrides the host platform, used by tests.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Resolves the seeds and everything reachable from them into a
    /// lock whose packages and workspaces maps are complete. Top-level
    /// dependency maps are the caller's concern.
    pub async fn run(self: Arc<Self>, mut seeds: Vec<Seed>) -> Result<Lockfile, Error> {
        // Sorted seeds and reserved root slots keep the placement
        // deterministic regardless of worker scheduling.
        seeds.sort_by(|a, b| a.name.cmp(&b.name));

        {
            let mut state = self.state.lock().expect("state poisoned");
            for seed in &seeds {
                state.reserved.insert(seed.name.clone());
            }
        }

        for seed in seeds {
            self.queue.push(Request {
                name: seed.name,
                spec: seed.spec,
                parent: None,
                dev: seed.dev,
                optional: seed.optional,
                peer: seed.peer,
            });
        }

        let workers: Vec<_> = (0..self.workers)
            .map(|_| {
                let resolver = self.clone();
                tokio::spawn(async move { resolver.worker().await })
            })
            .collect();

        for worker in workers {
            worker.await.map_err(|err| Error::Filesystem {
                context: "resolver worker panicked".into(),
                source: std::io::Error::other(err),
            })?;
        }

        if let Some(error) = self.first_error.lock().expect("mailbox poisoned").take() {
            return Err(error);
        }

        let lock = {
            let mut state = self.state.lock().expect("state poisoned");
            std::mem::take(&mut state.lock)
        };

        self.verify_peers(&lock);

        Ok(lock)
    }

    async fn worker(&self) {
        loop {
            let Some(request) = self.queue.next().await else {
                break;
            };

            if let Err(error) = self.resolve_one(&request).await {
                if request.optional {
                    tracing::warn!(
                        "warning: skipping optional dependency {}@{}: {error}",
                        request.name,
                        request.spec
                    );
                } else {
                    self.fail(error);
                }
            }

            self.queue.done();
        }
    }

    /// First error wins the mailbox; everyone else sees cancellation.
    fn fail(&self, error: Error) {
        let mut mailbox = self.first_error.lock().expect("mailbox poisoned");
        if mailbox.is_none() {
            *mailbox = Some(error);
        }
        drop(mailbox);

        self.queue.cancel();
    }

    async fn resolve_one(&self, request: &Request) -> Result<(), Error> {
        tracing::trace!(
            ":: resolving {}@{} (dev={}, optional={}, peer={})",
            request.name,
            request.spec,
            request.dev,
            request.optional,
            request.peer
        );

        // Workspace members substitute for registry fetches entirely.
        if let Some(member) = self.workspaces.lookup(&request.name) {
            let (path, manifest) = (member.path.clone(), member.manifest.clone());
            return self.resolve_workspace(request, &path, &manifest);
        }

        match classify(&request.spec) {
            Classified::Alias { effective, range } => {
                self.resolve_registry(request, &effective, &range).await
            }
            Classified::Registry { range } => {
                self.resolve_registry(request, &request.name, &range).await
            }
            Classified::SourceControl(source) => self.resolve_source(request, &source).await,
        }
    }

    fn resolve_workspace(
        &self,
        request: &Request,
        path: &std::path::Path,
        manifest: &Manifest,
    ) -> Result<(), Error> {
        let version = manifest.version.clone().unwrap_or_else(|| "0.0.0".to_owned());
        let placement_path;

        {
            let mut state = self.state.lock().expect("state poisoned");
            let key = format!("{}@workspace", request.name);
            if !state.processed.insert(key) {
                return Ok(());
            }

            placement_path = format!("node_modules/{}", request.name);
            state.hoisted.insert(
                request.name.clone(),
                Hoisted {
                    version: version.clone(),
                    path: placement_path.clone(),
                },
            );

            state
                .lock
                .workspaces
                .insert(request.name.clone(), version.clone());

            state.lock.packages.insert(
                placement_path.clone(),
                LockEntry {
                    name: Some(request.name.clone()),
                    version: Some(version),
                    resolved: Some(format!("file:{}", path.display())),
                    link: true,
                    dev: request.dev,
                    dependencies: manifest.dependencies.clone(),
                    optional_dependencies: manifest.optional_dependencies.clone(),
                    peer_dependencies: manifest.peer_dependencies.clone(),
                    peer_dependencies_meta: manifest.peer_dependencies_meta.clone(),
                    ..Default::default()
                },
            );
        }

        self.enqueue_children(request, &placement_path, manifest);

        Ok(())
    }

    async fn resolve_registry(
        &self,
        request: &Request,
        effective: &str,
        range: &str,
    ) -> Result<(), Error> {
        let packument = self.registry.fetch(effective).await?;
        let version = solver::resolve(range, &packument)?;

        let metadata = packument
            .versions
            .get(&version)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{effective}@{version}")))?;

        // Optional entries incompatible with the host are recorded but
        // never downloaded.
        if request.optional && !self.platform_admits(&metadata) {
            tracing::warn!(
                "warning: skipping optional dependency {}@{version}: unsupported platform",
                request.name
            );
            self.record_platform_skip(request, &version, &metadata);
            return Ok(());
        }

        let placement = {
            let mut state = self.state.lock().expect("state poisoned");
            state.place(&request.name, &version, range, request.parent.as_deref())
        };

        let Placement::New { path } = placement else {
            return Ok(());
        };

        let effective_name: PackageName = effective
            .parse()
            .map_err(|_| Error::NotFound(effective.to_owned()))?;

        let tree = self
            .store
            .materialize(
                &effective_name,
                &version,
                &metadata.dist.tarball,
                metadata.dist.integrity.as_deref(),
            )
            .await?;

        let extracted =
            Manifest::try_read_from(&tree.join(crate::manifest::MANIFEST_FILE)).await?;

        {
            let mut state = self.state.lock().expect("state poisoned");
            state.lock.packages.insert(
                path.clone(),
                LockEntry {
                    name: Some(request.name.clone()),
                    version: Some(version.clone()),
                    resolved: Some(metadata.dist.tarball.clone()),
                    integrity: metadata.dist.integrity.clone(),
                    etag: self.registry.etag(effective),
                    optional: request.optional,
                    dev: request.dev,
                    dependencies: metadata.dependencies.clone(),
                    optional_dependencies: metadata.optional_dependencies.clone(),
                    peer_dependencies: metadata.peer_dependencies.clone(),
                    peer_dependencies_meta: metadata.peer_dependencies_meta.clone(),
                    os: metadata.os.clone(),
                    cpu: metadata.cpu.clone(),
                    bin: metadata.bin.clone(),
                    engines: metadata.engines.clone(),
                    ..Default::default()
                },
            );
        }

        self.enqueue_children(request, &path, &extracted);

        Ok(())
    }

    async fn resolve_source(&self, request: &Request, source: &SourceRef) -> Result<(), Error> {
        let commit = self.github.resolve(source).await?;
        let tarball = self.github.tarball_url(source, &commit);

        let placement = {
            let mut state = self.state.lock().expect("state poisoned");
            state.place(&request.name, &commit, &request.spec, request.parent.as_deref())
        };

        let Placement::New { path } = placement else {
            return Ok(());
        };

        let name: PackageName = request
            .name
            .parse()
            .map_err(|_| Error::NotFound(request.name.clone()))?;

        let tree = self.store.materialize(&name, &commit, &tarball, None).await?;
        let extracted =
            Manifest::try_read_from(&tree.join(crate::manifest::MANIFEST_FILE)).await?;

        {
            let mut state = self.state.lock().expect("state poisoned");
            state.lock.packages.insert(
                path.clone(),
                LockEntry {
                    name: Some(request.name.clone()),
                    version: Some(commit.clone()),
                    resolved: Some(tarball),
                    optional: request.optional,
                    dev: request.dev,
                    dependencies: extracted.dependencies.clone(),
                    optional_dependencies: extracted.optional_dependencies.clone(),
                    peer_dependencies: extracted.peer_dependencies.clone(),
                    peer_dependencies_meta: extracted.peer_dependencies_meta.clone(),
                    bin: extracted.bin.clone(),
                    ..Default::default()
                },
            );
        }

        self.enqueue_children(request, &path, &extracted);

        Ok(())
    }

    fn platform_admits(&self, metadata: &VersionMetadata) -> bool {
        platform_allows(&metadata.os, &self.platform.os)
            && platform_allows(&metadata.cpu, &self.platform.cpu)
    }

    fn record_platform_skip(&self, request: &Request, version: &str, metadata: &VersionMetadata) {
        let mut state = self.state.lock().expect("state poisoned");

        let placement = state.place(&request.name, version, &request.spec, request.parent.as_deref());
        let Placement::New { path } = placement else {
            return;
        };

        state.lock.packages.insert(
            path,
            LockEntry {
                name: Some(request.name.clone()),
                version: Some(version.to_owned()),
                resolved: Some(String::new()),
                optional: true,
                dev: request.dev,
                os: metadata.os.clone(),
                cpu: metadata.cpu.clone(),
                ..Default::default()
            },
        );
    }

    /// Enqueues the runtime, optional and peer dependencies the
    /// extracted manifest declares. A dependency on the package itself
    /// is dropped to break trivial cycles in corrupt manifests.
    fn enqueue_children(&self, request: &Request, parent_path: &str, manifest: &Manifest) {
        let push = |name: &str, spec: &str, optional: bool, peer: bool| {
            if name == request.name {
                tracing::warn!("warning: {}", Error::CyclicSelfReference(name.to_owned()));
                return;
            }

            self.queue.push(Request {
                name: name.to_owned(),
                spec: spec.to_owned(),
                parent: Some(parent_path.to_owned()),
                dev: request.dev,
                optional: request.optional || optional,
                peer,
            });
        };

        for (name, spec) in &manifest.dependencies {
            push(name, spec, false, false);
        }

        for (name, spec) in &manifest.optional_dependencies {
            push(name, spec, true, false);
        }

        for (name, spec) in &manifest.peer_dependencies {
            let optional = manifest.peer_is_optional(name);
            push(name, spec, optional, true);
        }
    }

    /// Post-run verification: every peer requirement must be satisfied
    /// by the entry visible from the dependent. Violations warn, never
    /// fail.
    fn verify_peers(&self, lock: &Lockfile) {
        for (path, entry) in &lock.packages {
            for (peer, range) in &entry.peer_dependencies {
                let optional = entry
                    .peer_dependencies_meta
                    .get(peer)
                    .map(|meta| meta.optional)
                    .unwrap_or(false);

                let visible = lock
                    .packages
                    .get(&format!("{path}/node_modules/{peer}"))
                    .or_else(|| lock.packages.get(&format!("node_modules/{peer}")));

                match visible {
                    Some(found) => {
                        let satisfied = found
                            .version
                            .as_deref()
                            .is_some_and(|version| solver::satisfies(version, range));

                        if !satisfied {
                            tracing::warn!(
                                "warning: peer dependency {peer}@{range} of {path} is not satisfied"
                            );
                        }
                    }
                    None if optional => {}
                    None => {
                        tracing::warn!(
                            "warning: peer dependency {peer}@{range} of {path} is not installed"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TarballCache;
    use crate::config::Config;
    use crate::integrity;
    use crate::package::fixture_tarball;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn classifies_constraints() {
        assert!(matches!(classify("^1.0.0"), Classified::Registry { .. }));
        assert!(matches!(classify("latest"), Classified::Registry { .. }));

        match classify("npm:is-odd@^3.0.0") {
            Classified::Alias { effective, range } => {
                assert_eq!(effective, "is-odd");
                assert_eq!(range, "^3.0.0");
            }
            _ => panic!("expected alias"),
        }

        match classify("npm:@scope/real@~2.0.0") {
            Classified::Alias { effective, range } => {
                assert_eq!(effective, "@scope/real");
                assert_eq!(range, "~2.0.0");
            }
            _ => panic!("expected alias"),
        }

        assert!(matches!(
            classify("github:owner/repo#main"),
            Classified::SourceControl(_)
        ));
    }

    #[test]
    fn platform_lists() {
        let allows = |list: &[&str], host: &str| {
            platform_allows(&list.iter().map(|s| s.to_string()).collect::<Vec<_>>(), host)
        };

        assert!(allows(&[], "linux"));
        assert!(allows(&["linux"], "linux"));
        assert!(!allows(&["darwin"], "linux"));
        assert!(!allows(&["!linux"], "linux"));
        assert!(allows(&["!darwin"], "linux"));
        assert!(allows(&["!darwin", "linux"], "linux"));
        assert!(!allows(&["!darwin", "win32"], "linux"));
    }

    #[tokio::test]
    async fn queue_terminates_when_drained() {
        let queue = Arc::new(WorkQueue::new());
        queue.push(Request {
            name: "a".into(),
            spec: "*".into(),
            parent: None,
            dev: false,
            optional: false,
            peer: false,
        });

        let popped = queue.next().await.unwrap();
        assert_eq!(popped.name, "a");

        // The single active worker finishing must release the waiter.
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };

        queue.done();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queue_cancel_releases_waiters() {
        let queue = Arc::new(WorkQueue::new());
        queue.push(Request {
            name: "a".into(),
            spec: "*".into(),
            parent: None,
            dev: false,
            optional: false,
            peer: false,
        });
        let _held = queue.next().await.unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };

        queue.cancel();
        assert!(waiter.await.unwrap().is_none());
    }

    #[test]
    fn placement_first_wins_then_nests() {
        let mut state = State::default();

        // First resolution of x wins the root slot.
        assert!(matches!(
            state.place("x", "1.9.0", "^1.0.0", Some("node_modules/a")),
            Placement::New { path } if path == "node_modules/x"
        ));

        // A compatible constraint reuses it.
        assert!(matches!(
            state.place("x", "1.9.0", "^1.2.0", Some("node_modules/c")),
            Placement::Skip
        ));

        // An incompatible constraint nests beneath its parent.
        assert!(matches!(
            state.place("x", "2.1.0", "^2.0.0", Some("node_modules/b")),
            Placement::New { path } if path == "node_modules/b/node_modules/x"
        ));

        // The same nested placement is processed once.
        assert!(matches!(
            state.place("x", "2.1.0", "^2.0.0", Some("node_modules/b")),
            Placement::Skip
        ));
    }

    #[test]
    fn reserved_root_slots_push_children_aside() {
        let mut state = State::default();
        state.reserved.insert("x".into());

        assert!(matches!(
            state.place("x", "2.0.0", "^2.0.0", Some("node_modules/a")),
            Placement::New { path } if path == "node_modules/a/node_modules/x"
        ));

        // The declared top-level x still claims the root slot.
        assert!(matches!(
            state.place("x", "1.0.0", "^1.0.0", None),
            Placement::New { path } if path == "node_modules/x"
        ));
    }

    struct Fixture {
        server: mockito::ServerGuard,
        _base: tempfile::TempDir,
        config: Config,
    }

    impl Fixture {
        async fn new() -> Self {
            let server = mockito::Server::new_async().await;
            let base = tempfile::tempdir().unwrap();
            let config = Config::with_base(base.path(), server.url().parse().unwrap());

            Self {
                server,
                _base: base,
                config,
            }
        }

        /// Serves a packument plus one tarball per version.
        async fn publish(&mut self, name: &str, versions: &[(&str, serde_json::Value)]) {
            let mut version_map = serde_json::Map::new();
            let mut latest = String::new();

            for (version, deps) in versions {
                let tarball = fixture_tarball(&[(
                    "package.json",
                    &serde_json::to_string(&json!({
                        "name": name,
                        "version": version,
                        "dependencies": deps,
                    }))
                    .unwrap(),
                )]);

                let sri = integrity::sri_sha512(&tarball);
                let route = format!("/{name}/-/{name}-{version}.tgz");

                self.server
                    .mock("GET", route.as_str())
                    .with_status(200)
                    .with_body(tarball)
                    .create_async()
                    .await;

                version_map.insert(
                    (*version).to_owned(),
                    json!({
                        "name": name,
                        "version": version,
                        "dependencies": deps,
                        "dist": {
                            "tarball": format!("{}{}", self.server.url(), route),
                            "integrity": sri,
                        },
                    }),
                );

                latest = (*version).to_owned();
            }

            let packument = json!({
                "name": name,
                "dist-tags": {"latest": latest},
                "versions": version_map,
            });

            self.server
                .mock("GET", format!("/{name}").as_str())
                .with_status(200)
                .with_body(packument.to_string())
                .create_async()
                .await;
        }

        fn resolver(&self) -> Arc<Resolver> {
            let registry = Arc::new(RegistryClient::new(&self.config).unwrap());
            let cache = Arc::new(TarballCache::new(&self.config).unwrap());
            let store = Arc::new(PackageStore::new(&self.config, cache));
            let github = Arc::new(GitHub::new().unwrap());

            Arc::new(
                Resolver::new(registry, github, store, Arc::new(WorkspaceSet::default()))
                    .with_workers(4),
            )
        }
    }

    #[tokio::test]
    async fn resolves_transitive_graph() {
        let mut fixture = Fixture::new().await;

        fixture
            .publish("is-odd", &[("3.0.1", json!({"is-number": "^6.0.0"}))])
            .await;
        fixture.publish("is-number", &[("6.0.0", json!({}))]).await;

        let lock = fixture
            .resolver()
            .run(vec![Seed::new("is-odd", "3.0.1", DependencyKind::Runtime)])
            .await
            .unwrap();

        let odd = lock.packages.get("node_modules/is-odd").unwrap();
        assert_eq!(odd.version.as_deref(), Some("3.0.1"));
        assert!(odd.integrity.is_some());

        let number = lock.packages.get("node_modules/is-number").unwrap();
        assert_eq!(number.version.as_deref(), Some("6.0.0"));
    }

    #[tokio::test]
    async fn empty_seed_list_resolves_to_empty_lock() {
        let fixture = Fixture::new().await;

        let lock = fixture.resolver().run(Vec::new()).await.unwrap();

        assert!(lock.packages.is_empty());
    }

    #[tokio::test]
    async fn version_conflict_nests_the_second_arrival() {
        let mut fixture = Fixture::new().await;

        fixture.publish("a", &[("1.0.0", json!({"x": "^1.0.0"}))]).await;
        fixture.publish("b", &[("1.0.0", json!({"x": "^2.0.0"}))]).await;
        fixture
            .publish("x", &[("1.9.0", json!({})), ("2.1.0", json!({}))])
            .await;

        let lock = fixture
            .resolver()
            .run(vec![
                Seed::new("a", "^1.0.0", DependencyKind::Runtime),
                Seed::new("b", "^1.0.0", DependencyKind::Runtime),
            ])
            .await
            .unwrap();

        let hoisted = lock.packages.get("node_modules/x").expect("x is hoisted");
        let hoisted_version = hoisted.version.clone().unwrap();

        let nested_path = if hoisted_version == "1.9.0" {
            "node_modules/b/node_modules/x"
        } else {
            "node_modules/a/node_modules/x"
        };

        let nested = lock.packages.get(nested_path).expect("conflicting x is nested");
        assert_ne!(nested.version, hoisted.version);
        assert_eq!(lock.packages.len(), 4);
    }

    #[tokio::test]
    async fn alias_resolves_effective_package_under_declared_name() {
        let mut fixture = Fixture::new().await;

        fixture.publish("is-odd", &[("3.0.1", json!({}))]).await;

        let lock = fixture
            .resolver()
            .run(vec![Seed::new(
                "my-is-odd",
                "npm:is-odd@3.0.1",
                DependencyKind::Runtime,
            )])
            .await
            .unwrap();

        let entry = lock.packages.get("node_modules/my-is-odd").unwrap();
        assert_eq!(entry.name.as_deref(), Some("my-is-odd"));
        assert_eq!(entry.version.as_deref(), Some("3.0.1"));
        assert!(entry.resolved.as_deref().unwrap().contains("/is-odd/-/is-odd-3.0.1.tgz"));

        // The store is keyed by the effective name.
        assert!(
            fixture
                .config
                .packages_dir()
                .join("is-odd@3.0.1")
                .join("package.json")
                .exists()
        );
    }

    #[tokio::test]
    async fn platform_incompatible_optional_is_recorded_without_download() {
        let mut fixture = Fixture::new().await;

        // Publish metadata only; any tarball request would 501.
        let packument = json!({
            "name": "native-helper",
            "dist-tags": {"latest": "1.0.0"},
            "versions": {
                "1.0.0": {
                    "name": "native-helper",
                    "version": "1.0.0",
                    "os": ["aix"],
                    "cpu": ["s390x"],
                    "dist": {"tarball": format!("{}/native-helper/-/native-helper-1.0.0.tgz", fixture.server.url())},
                }
            }
        });

        fixture
            .server
            .mock("GET", "/native-helper")
            .with_status(200)
            .with_body(packument.to_string())
            .create_async()
            .await;

        let lock = fixture
            .resolver()
            .run(vec![Seed::new("native-helper", "^1.0.0", DependencyKind::Optional)])
            .await
            .unwrap();

        let entry = lock.packages.get("node_modules/native-helper").unwrap();
        assert_eq!(entry.resolved.as_deref(), Some(""));
        assert!(entry.optional);
        assert_eq!(entry.os, vec!["aix"]);
        assert_eq!(entry.cpu, vec!["s390x"]);
    }

    #[tokio::test]
    async fn missing_required_dependency_aborts() {
        let mut fixture = Fixture::new().await;

        fixture
            .server
            .mock("GET", "/ghost")
            .with_status(404)
            .create_async()
            .await;

        let err = fixture
            .resolver()
            .run(vec![Seed::new("ghost", "^1.0.0", DependencyKind::Runtime)])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotFound(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn missing_optional_dependency_is_skipped() {
        let mut fixture = Fixture::new().await;

        fixture
            .server
            .mock("GET", "/ghost")
            .with_status(404)
            .create_async()
            .await;
        fixture.publish("is-odd", &[("3.0.1", json!({}))]).await;

        let lock = fixture
            .resolver()
            .run(vec![
                Seed::new("ghost", "^1.0.0", DependencyKind::Optional),
                Seed::new("is-odd", "3.0.1", DependencyKind::Runtime),
            ])
            .await
            .unwrap();

        assert!(lock.packages.contains_key("node_modules/is-odd"));
        assert!(!lock.packages.contains_key("node_modules/ghost"));
    }

    #[tokio::test]
    async fn self_referencing_dependency_is_dropped() {
        let mut fixture = Fixture::new().await;

        fixture
            .publish("narcissus", &[("1.0.0", json!({"narcissus": "^1.0.0"}))])
            .await;

        let lock = fixture
            .resolver()
            .run(vec![Seed::new("narcissus", "^1.0.0", DependencyKind::Runtime)])
            .await
            .unwrap();

        assert_eq!(lock.packages.len(), 1);
    }

    #[tokio::test]
    async fn unsatisfiable_range_records_latest() {
        let mut fixture = Fixture::new().await;

        fixture.publish("is-odd", &[("3.0.1", json!({}))]).await;

        let lock = fixture
            .resolver()
            .run(vec![Seed::new("is-odd", "^9.0.0", DependencyKind::Runtime)])
            .await
            .unwrap();

        let entry = lock.packages.get("node_modules/is-odd").unwrap();
        assert_eq!(entry.version.as_deref(), Some("3.0.1"));
    }

    #[tokio::test]
    async fn two_runs_agree_on_the_package_set() {
        let mut fixture = Fixture::new().await;

        fixture
            .publish("is-odd", &[("3.0.1", json!({"is-number": "^6.0.0"}))])
            .await;
        fixture.publish("is-number", &[("6.0.0", json!({}))]).await;
        fixture.publish("is-even", &[("1.0.0", json!({"is-odd": "3.0.1"}))]).await;

        let seeds = || {
            vec![
                Seed::new("is-even", "^1.0.0", DependencyKind::Runtime),
                Seed::new("is-odd", "3.0.1", DependencyKind::Runtime),
            ]
        };

        let first = fixture.resolver().run(seeds()).await.unwrap();
        let second = fixture.resolver().run(seeds()).await.unwrap();

        let keys = |lock: &Lockfile| lock.packages.keys().cloned().collect::<Vec<_>>();
        assert_eq!(keys(&first), keys(&second));
    }

    #[tokio::test]
    async fn workspace_member_links_without_network() {
        let mut fixture = Fixture::new().await;

        fixture.publish("is-odd", &[("3.0.1", json!({}))]).await;

        let project = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(project.path().join("packages/local-lib")).unwrap();
        std::fs::write(
            project.path().join("packages/local-lib/package.json"),
            r#"{"name": "local-lib", "version": "0.1.0", "dependencies": {"is-odd": "3.0.1"}}"#,
        )
        .unwrap();

        let workspaces =
            WorkspaceSet::discover(project.path(), &["packages/*".to_owned()]).unwrap();

        let registry = Arc::new(RegistryClient::new(&fixture.config).unwrap());
        let cache = Arc::new(TarballCache::new(&fixture.config).unwrap());
        let store = Arc::new(PackageStore::new(&fixture.config, cache));
        let github = Arc::new(GitHub::new().unwrap());

        let resolver = Arc::new(
            Resolver::new(registry, github, store, Arc::new(workspaces)).with_workers(2),
        );

        let lock = resolver
            .run(vec![Seed::new("local-lib", "*", DependencyKind::Runtime)])
            .await
            .unwrap();

        let entry = lock.packages.get("node_modules/local-lib").unwrap();
        assert!(entry.link);
        assert!(entry.resolved.as_deref().unwrap().starts_with("file:"));
        assert_eq!(lock.workspaces.get("local-lib").unwrap(), "0.1.0");

        // The member's own dependencies were walked.
        assert!(lock.packages.contains_key("node_modules/is-odd"));
    }
}
