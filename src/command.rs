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

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use miette::{Context as _, IntoDiagnostic, miette};

use crate::bins;
use crate::config::Config;
use crate::context::Context;
use crate::installer::Installer;
use crate::lock::{LOCKFILE, Lockfile, entry_name};
use crate::manifest::{DependencyKind, License, Manifest};
use crate::reconcile;
use crate::resolver::Seed;
use crate::scripts::ScriptRunner;
use crate::solver;
use crate::workspace::WorkspaceSet;
use crate::yarn;

/// Splits a `name[@version]` argument, keeping the scope marker intact.
fn split_spec(input: &str) -> (String, Option<String>) {
    let search_from = if input.starts_with('@') { 1 } else { 0 };

    match input[search_from..].find('@') {
        Some(at) => {
            let at = at + search_from;
            (input[..at].to_owned(), Some(input[at + 1..].to_owned()))
        }
        None => (input.to_owned(), None),
    }
}

fn cwd() -> miette::Result<PathBuf> {
    std::env::current_dir()
        .into_diagnostic()
        .wrap_err("current dir could not be retrieved")
}

async fn discover_workspaces(root: &Path, manifest: &Manifest) -> miette::Result<Arc<WorkspaceSet>> {
    Ok(Arc::new(WorkspaceSet::discover(
        root,
        &manifest.workspaces.0,
    )?))
}

/// Installs dependencies for the current project, or a single package
/// when one is named (`install pkg` behaves like `add`).
pub async fn install(
    production: bool,
    global: bool,
    package: Option<String>,
    ignore_scripts: bool,
) -> miette::Result<()> {
    if let Some(spec) = package {
        return if global {
            install_global(spec, ignore_scripts).await
        } else {
            add(spec, ignore_scripts).await
        };
    }

    if global {
        // Restore the global tree from its recorded lock.
        let ctx = Context::open().await?;
        let config = ctx.config();
        let lock = Lockfile::read_or_default(&config.global_lockfile()).await?;

        Installer::new(ctx.store().clone())
            .install(&lock, &config.global_dir(), &BTreeSet::new())
            .await?;

        bins::link_into(&config.global_node_modules(), &config.global_bin_dir()).await?;

        return Ok(());
    }

    let ctx = Context::open().await?;
    let root = cwd()?;

    let manifest = Manifest::read()
        .await
        .map_err(|err| miette!("{err}"))
        .wrap_err("no package.json in the current directory")?;

    let workspaces = discover_workspaces(&root, &manifest).await?;
    let lock_path = root.join(LOCKFILE);

    let mut lock = if lock_path.exists() {
        let existing = Lockfile::read_from(&lock_path).await?;
        reconcile_existing(&ctx, &manifest, existing, workspaces.clone(), &root).await?
    } else if root.join(yarn::YARN_LOCKFILE).exists() {
        tracing::info!(":: importing yarn.lock");
        let yarn_text = tokio::fs::read_to_string(root.join(yarn::YARN_LOCKFILE))
            .await
            .into_diagnostic()?;
        yarn::convert(&yarn_text, &manifest)
    } else {
        let seeds: Vec<Seed> = manifest
            .declared(true)
            .into_iter()
            .map(|(name, spec, kind)| Seed::new(name, spec, kind))
            .collect();

        ctx.resolver(workspaces.clone()).run(seeds).await?
    };

    // The top-level maps are always the declared constraints, verbatim.
    lock.name = manifest.name.clone();
    lock.version = manifest.version.clone();
    lock.dependencies = manifest.dependencies.clone();
    lock.dev_dependencies = manifest.dev_dependencies.clone();
    lock.optional_dependencies = manifest.optional_dependencies.clone();
    lock.peer_dependencies = manifest.peer_dependencies.clone();

    lock.create(&lock_path).await?;

    let prune = if production {
        reconcile::production_prune(&lock)
    } else {
        BTreeSet::new()
    };

    let installer = Installer::new(ctx.store().clone());
    let installed = installer.install(&lock, &root, &prune).await?;

    if production && !prune.is_empty() {
        installer.remove_paths(&root, &prune).await?;
    }

    run_install_scripts(&manifest, &lock, &root, &prune, ignore_scripts).await?;

    tracing::info!(
        ":: installed {installed} package{}",
        if installed == 1 { "" } else { "s" }
    );

    Ok(())
}

/// Applies the manifest/lock delta: resolves missing entries, strips
/// undeclared ones.
async fn reconcile_existing(
    ctx: &Arc<Context>,
    manifest: &Manifest,
    mut lock: Lockfile,
    workspaces: Arc<WorkspaceSet>,
    root: &Path,
) -> miette::Result<Lockfile> {
    let delta = reconcile::diff(manifest, &lock);

    if delta.is_empty() {
        return Ok(lock);
    }

    for name in &delta.remove {
        let orphaned = reconcile::orphans(&lock, name);
        Installer::new(ctx.store().clone())
            .remove_paths(root, &orphaned)
            .await?;
        reconcile::strip(&mut lock, name, &orphaned);
    }

    if !delta.install.is_empty() {
        let partial = ctx.resolver(workspaces).run(delta.seeds()).await?;
        lock.merge(partial);
    }

    Ok(lock)
}

/// Runs lifecycle scripts for the freshly installed tree: trusted
/// dependencies first, then the project's own scripts.
async fn run_install_scripts(
    manifest: &Manifest,
    lock: &Lockfile,
    root: &Path,
    prune: &BTreeSet<String>,
    ignore_scripts: bool,
) -> miette::Result<()> {
    let runner = ScriptRunner::new(ignore_scripts);

    for (path, entry) in &lock.packages {
        if prune.contains(path) || entry.link || entry.resolved.as_deref().is_none_or(str::is_empty)
        {
            continue;
        }

        let installed = root.join(path);
        let Ok(package_manifest) = Manifest::try_read_from(&installed.join("package.json")).await
        else {
            continue;
        };

        if package_manifest.scripts.is_empty() {
            continue;
        }

        let name = entry_name(path);
        let trusted = manifest.trusted_dependencies.contains(name);

        runner
            .run_lifecycle(
                &package_manifest.scripts,
                &installed,
                name,
                entry.version.as_deref().unwrap_or("0.0.0"),
                trusted,
            )
            .await?;
    }

    runner
        .run_lifecycle(
            &manifest.scripts,
            root,
            manifest.name.as_deref().unwrap_or("project"),
            manifest.version.as_deref().unwrap_or("0.0.0"),
            true,
        )
        .await
}

/// Adds a dependency to the manifest, resolves it, updates the lock in
/// place, and materializes the tree.
pub async fn add(spec: String, ignore_scripts: bool) -> miette::Result<()> {
    let (name, requested) = split_spec(spec.trim());

    let ctx = Context::open().await?;
    let root = cwd()?;

    let mut manifest = if Manifest::exists().await? {
        Manifest::read().await?
    } else {
        Manifest::default()
    };

    let workspaces = discover_workspaces(&root, &manifest).await?;

    let resolve_spec = requested.clone().unwrap_or_else(|| "latest".to_owned());
    let partial = ctx
        .resolver(workspaces)
        .run(vec![Seed::new(name.clone(), resolve_spec, DependencyKind::Runtime)])
        .await?;

    let resolved_version = partial
        .packages
        .get(&format!("node_modules/{name}"))
        .and_then(|entry| entry.version.clone())
        .ok_or_else(|| miette!("{name} did not resolve to an installable version"))?;

    // A bare `add name` pins the caret range of whatever resolved.
    let range = requested.unwrap_or_else(|| format!("^{resolved_version}"));

    manifest.dependencies.insert(name.clone(), range.clone());
    manifest.write().await?;

    let mut update = partial;
    update.name = manifest.name.clone();
    update.version = manifest.version.clone();
    update.dependencies.insert(name.clone(), range);

    let lock_path = root.join(LOCKFILE);
    update.update(&lock_path).await?;

    let merged = Lockfile::read_from(&lock_path).await?;
    Installer::new(ctx.store().clone())
        .install(&merged, &root, &BTreeSet::new())
        .await?;

    run_install_scripts(&manifest, &merged, &root, &BTreeSet::new(), ignore_scripts).await?;

    tracing::info!(":: added {name}@{resolved_version}");

    Ok(())
}

/// Removes a dependency and the closure reachable only through it.
pub async fn remove(package: String) -> miette::Result<()> {
    let name = package.trim().to_owned();

    let ctx = Context::open().await?;
    let root = cwd()?;

    let mut manifest = Manifest::read()
        .await
        .map_err(|err| miette!("{err}"))
        .wrap_err("no package.json in the current directory")?;

    if !manifest.declares(&name) {
        return Err(miette!("{name} is not a dependency of this project"));
    }

    let lock_path = root.join(LOCKFILE);
    let mut lock = Lockfile::read_or_default(&lock_path).await?;

    let orphaned = reconcile::orphans(&lock, &name);

    Installer::new(ctx.store().clone())
        .remove_paths(&root, &orphaned)
        .await?;

    reconcile::strip(&mut lock, &name, &orphaned);

    manifest.dependencies.remove(&name);
    manifest.dev_dependencies.remove(&name);
    manifest.optional_dependencies.remove(&name);
    manifest.peer_dependencies.remove(&name);
    manifest.write().await?;

    lock.create(&lock_path).await?;

    tracing::info!(
        ":: removed {name} and {} orphaned package{}",
        orphaned.len().saturating_sub(1),
        if orphaned.len() == 2 { "" } else { "s" }
    );

    Ok(())
}

/// Uninstalls a package, locally or from the global installation.
pub async fn uninstall(package: String, global: bool) -> miette::Result<()> {
    if !global {
        return remove(package).await;
    }

    let name = package.trim().to_owned();
    let ctx = Context::open().await?;
    let config = ctx.config();
    let global_root = config.global_dir();
    let lock_path = config.global_lockfile();

    let mut lock = Lockfile::read_or_default(&lock_path).await?;

    if !lock.dependencies.contains_key(&name) {
        return Err(miette!("{name} is not installed globally"));
    }

    let orphaned = reconcile::orphans(&lock, &name);

    Installer::new(ctx.store().clone())
        .remove_paths(&global_root, &orphaned)
        .await?;

    reconcile::strip(&mut lock, &name, &orphaned);
    lock.create(&lock_path).await?;

    bins::prune_dangling_in(&config.global_bin_dir()).await?;

    tracing::info!(":: removed {name} from the global installation");

    Ok(())
}

/// Resolves a package into the global installation root.
async fn install_global(spec: String, ignore_scripts: bool) -> miette::Result<()> {
    let (name, requested) = split_spec(spec.trim());

    let ctx = Context::open().await?;
    let config = ctx.config();
    let global_root = config.global_dir();
    let lock_path = config.global_lockfile();

    let resolve_spec = requested.clone().unwrap_or_else(|| "latest".to_owned());
    let partial = ctx
        .resolver(Arc::new(WorkspaceSet::default()))
        .run(vec![Seed::new(name.clone(), resolve_spec, DependencyKind::Runtime)])
        .await?;

    let resolved_version = partial
        .packages
        .get(&format!("node_modules/{name}"))
        .and_then(|entry| entry.version.clone())
        .ok_or_else(|| miette!("{name} did not resolve to an installable version"))?;

    let range = requested.unwrap_or_else(|| format!("^{resolved_version}"));

    let mut update = partial;
    update.dependencies.insert(name.clone(), range);
    update.update(&lock_path).await?;

    let merged = Lockfile::read_from(&lock_path).await?;
    Installer::new(ctx.store().clone())
        .install(&merged, &global_root, &BTreeSet::new())
        .await?;

    bins::link_into(&config.global_node_modules(), &config.global_bin_dir()).await?;

    if !ignore_scripts {
        tracing::debug!(":: global install skips dependency lifecycle scripts");
    }

    tracing::info!(
        ":: installed {name}@{resolved_version} globally (binaries in {})",
        config.global_bin_dir().display()
    );

    Ok(())
}

/// Prints the installed tree recorded in the lock.
pub async fn list(all: bool) -> miette::Result<()> {
    let root = cwd()?;
    let lock_path = root.join(LOCKFILE);

    if !lock_path.exists() {
        return Err(miette!("no {LOCKFILE} found, run install first"));
    }

    let lock = Lockfile::read_from(&lock_path).await?;

    println!(
        "{}@{}",
        lock.name.as_deref().unwrap_or("(unnamed)"),
        lock.version.as_deref().unwrap_or("0.0.0")
    );

    let top: Vec<&String> = lock
        .dependencies
        .keys()
        .chain(lock.dev_dependencies.keys())
        .chain(lock.optional_dependencies.keys())
        .collect();

    for name in &top {
        let path = format!("node_modules/{name}");
        print_subtree(&lock, &path, 1, all, &mut BTreeSet::new());
    }

    Ok(())
}

fn print_subtree(
    lock: &Lockfile,
    path: &str,
    depth: usize,
    all: bool,
    visiting: &mut BTreeSet<String>,
) {
    let Some(entry) = lock.packages.get(path) else {
        return;
    };

    let name = entry_name(path);
    let version = entry.version.as_deref().unwrap_or("?");
    let marker = if entry.link { " (workspace)" } else { "" };

    println!("{}{name}@{version}{marker}", "  ".repeat(depth));

    if !all || !visiting.insert(path.to_owned()) {
        return;
    }

    for child in reconcile::edges(lock, path) {
        print_subtree(lock, &child, depth + 1, all, visiting);
    }

    visiting.remove(path);
}

/// Prints registry metadata for a package, or one of its versions.
pub async fn info(spec: String) -> miette::Result<()> {
    let (name, requested) = split_spec(spec.trim());

    let ctx = Context::open().await?;
    let packument = ctx.registry().fetch(&name).await?;

    let license: License =
        serde_json::from_value(packument.license.clone()).unwrap_or(License::Absent);

    println!("{name}");
    if let Some(description) = &packument.description {
        println!("  {description}");
    }
    if let Some(id) = license.id() {
        println!("  license: {id}");
    }

    if !packument.dist_tags.is_empty() {
        let tags: Vec<String> = packument
            .dist_tags
            .iter()
            .map(|(tag, version)| format!("{tag}: {version}"))
            .collect();
        println!("  dist-tags: {}", tags.join(", "));
    }

    println!("  versions: {}", packument.versions.len());

    let version = match requested {
        Some(range) => solver::resolve(&range, &packument)?,
        None => packument
            .latest()
            .map(str::to_owned)
            .ok_or_else(|| miette!("{name} has no latest dist-tag"))?,
    };

    let Some(metadata) = packument.versions.get(&version) else {
        return Err(miette!("{name}@{version} is not published"));
    };

    println!("\n{name}@{version}");
    if !metadata.dependencies.is_empty() {
        println!("  dependencies:");
        for (dep, range) in &metadata.dependencies {
            println!("    {dep}: {range}");
        }
    }
    if !metadata.os.is_empty() {
        println!("  os: {}", metadata.os.join(", "));
    }
    if !metadata.cpu.is_empty() {
        println!("  cpu: {}", metadata.cpu.join(", "));
    }
    if !metadata.dist.tarball.is_empty() {
        println!("  tarball: {}", metadata.dist.tarball);
    }
    if let Some(integrity) = &metadata.dist.integrity {
        println!("  integrity: {integrity}");
    }
    if let Some(published) = packument.time.get(&version) {
        println!("  published: {published}");
    }

    Ok(())
}

/// Runs a script declared in the project manifest.
pub async fn run_script(script: String) -> miette::Result<()> {
    let root = cwd()?;
    let manifest = Manifest::read()
        .await
        .map_err(|err| miette!("{err}"))
        .wrap_err("no package.json in the current directory")?;

    let Some(command) = manifest.scripts.get(&script) else {
        let available: Vec<&String> = manifest.scripts.keys().collect();
        return Err(miette!(
            "no script named {script:?}; available: {}",
            if available.is_empty() {
                "none".to_owned()
            } else {
                available
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        ));
    };

    ScriptRunner::default()
        .run(
            command,
            &script,
            &root,
            manifest.name.as_deref().unwrap_or("project"),
            manifest.version.as_deref().unwrap_or("0.0.0"),
        )
        .await
}

/// Clears the shared caches: manifests, entity tags, archives and
/// extracted packages.
pub async fn cache_rm() -> miette::Result<()> {
    let config = Config::load()?;

    for dir in [
        config.manifest_dir(),
        config.etag_dir(),
        config.tarball_dir(),
        config.packages_dir(),
    ] {
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(miette!("failed to clear {}: {err}", dir.display()));
            }
        }
    }

    config.init().await?;

    tracing::info!(":: cache cleared");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn splits_plain_and_scoped_specs() {
        assert_eq!(split_spec("is-odd"), ("is-odd".into(), None));
        assert_eq!(
            split_spec("is-odd@3.0.1"),
            ("is-odd".into(), Some("3.0.1".into()))
        );
        assert_eq!(split_spec("@types/node"), ("@types/node".into(), None));
        assert_eq!(
            split_spec("@types/node@^20.0.0"),
            ("@types/node".into(), Some("^20.0.0".into()))
        );
        assert_eq!(
            split_spec("my-alias@npm:is-odd@3.0.1"),
            ("my-alias".into(), Some("npm:is-odd@3.0.1".into()))
        );
    }
}
