//! Discovery, loading, and hot-reloading of hook modules.
//!
//! A hook module is a dynamic library whose file name ends in
//! `.hook.<dylib-ext>` (`.hook.so` on Linux), placed under the configured
//! base directory. The library exports one entry symbol,
//! [`MODULE_ENTRY`], returning a [`ModuleManifest`]: the module-wide
//! default priority plus the named callables it declares. Every export
//! whose name follows the hook naming grammar becomes a registered
//! [`HookFunction`](crate::hooks::HookFunction); other exports are ignored.
//!
//! Loading is non-fatal throughout: a module that fails to open, lacks the
//! entry symbol, or panics while building its manifest contributes zero
//! functions and is logged, without affecting other modules.
//!
//! The base directory is watched; filesystem events are coalesced over a
//! 200 ms quiescence window into one reload batch. Reloading a module first
//! removes every function carrying its source, then registers the fresh
//! exports. Replaced libraries are retired, never unloaded: a chain spawned
//! before the reload may still be executing their code.

use crate::hooks::{self, CategoryMask, HookArgs, HookFn, HookFunction, MatchMode, Registry};
use crate::lists::RingQueue;
use crate::prelude::*;
use libloading::Library;
use notify::{EventKind, RecursiveMode, Watcher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Symbol every hook module exports.
pub const MODULE_ENTRY: &[u8] = b"gantry_hook_module";

/// Quiescence window for coalescing filesystem events into a reload batch.
pub const RELOAD_QUIESCENCE: Duration = Duration::from_millis(200);

type ModuleEntry = fn() -> ModuleManifest;

/// One named callable exported by a module.
pub struct HookExport {
    /// Declared name, decoded per the naming grammar.
    pub name: String,
    /// Priority override; falls back to the module default.
    pub priority: Option<i32>,
    pub body: HookFn,
}

impl HookExport {
    #[must_use]
    pub fn new(name: impl Into<String>, body: HookFn) -> Self {
        Self {
            name: name.into(),
            priority: None,
            body,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

impl Debug for HookExport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookExport")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

/// What a module's entry symbol returns.
#[derive(Debug)]
pub struct ModuleManifest {
    /// Priority for exports which do not declare their own.
    pub default_priority: i32,
    pub exports: Vec<HookExport>,
}

impl ModuleManifest {
    #[must_use]
    pub fn new() -> Self {
        Self {
            default_priority: 0,
            exports: Vec::new(),
        }
    }

    #[must_use]
    pub fn default_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    #[must_use]
    pub fn export(mut self, export: HookExport) -> Self {
        self.exports.push(export);
        self
    }
}

impl Default for ModuleManifest {
    fn default() -> Self {
        Self::new()
    }
}

fn module_suffix() -> String {
    format!(".hook.{}", std::env::consts::DLL_EXTENSION)
}

/// Whether `path` names a hook module file.
#[must_use]
pub fn is_module_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| name.ends_with(&module_suffix()))
}

/// The module's source identifier: its file name with the suffix stripped.
#[must_use]
pub fn module_source(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(&module_suffix())?;
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_owned())
    }
}

/// Loads hook modules from a directory and keeps the [`Registry`] in sync
/// with it.
pub struct Loader {
    base: PathBuf,
    recursive: bool,
    registry: Arc<Registry>,
    // Living libraries by source; code from entries here may be executing.
    modules: Mutex<HashMap<String, Library>>,
    // Replaced libraries, kept alive for the lifetime of the process.
    retired: Mutex<Vec<Library>>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl Loader {
    #[must_use]
    pub fn new(base: PathBuf, recursive: bool, registry: Arc<Registry>) -> Self {
        // An absolute base makes watcher event paths absolute, which the
        // module-changed hook promises its listeners.
        let base = std::fs::canonicalize(&base).unwrap_or(base);
        Self {
            base,
            recursive,
            registry,
            modules: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        }
    }

    #[inline]
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Loads every module currently present under the base directory.
    pub fn load_all(&self) {
        let mut paths = Vec::new();
        scan(&self.base, self.recursive, &mut paths);
        paths.sort();
        for path in &paths {
            self.load_module(path);
        }
        info!(
            "scanned {} for hook modules: {} found",
            self.base.display(),
            paths.len()
        );
    }

    /// Loads or reloads the module at `path`.
    ///
    /// Any failure leaves the module contributing zero functions; its
    /// previously registered functions are removed either way.
    pub fn load_module(&self, path: &Path) {
        let Some(source) = module_source(path) else {
            return;
        };
        self.registry.remove_source(&source);

        let library = match unsafe { Library::new(path) } {
            Ok(library) => library,
            Err(err) => {
                warn!("failed to open hook module {}: {err}", path.display());
                self.retire(&source, None);
                return;
            }
        };
        // Copy the entry pointer out so the symbol's borrow of the library
        // ends here; the library itself stays alive for as long as any of
        // its code can run.
        let entry: Option<ModuleEntry> = match unsafe { library.get::<ModuleEntry>(MODULE_ENTRY) } {
            Ok(symbol) => Some(*symbol),
            Err(err) => {
                warn!(
                    "hook module {} has no usable entry symbol: {err}",
                    path.display()
                );
                None
            }
        };
        let Some(entry) = entry else {
            self.retire(&source, Some(library));
            return;
        };
        let manifest = match catch_unwind(AssertUnwindSafe(entry)) {
            Ok(manifest) => manifest,
            Err(_) => {
                warn!("hook module {} panicked in its entry", path.display());
                self.retire(&source, Some(library));
                return;
            }
        };

        let mut registered = 0_usize;
        for export in manifest.exports {
            let priority = export.priority.unwrap_or(manifest.default_priority);
            match HookFunction::from_declared(&source, &export.name, priority, export.body) {
                Some(function) => {
                    self.registry.register(function);
                    registered += 1;
                }
                None => {
                    debug!("export {:?} of module {source} is not a hook function", export.name);
                }
            }
        }
        info!("module {source}: {registered} hook functions");
        self.retire(&source, Some(library));
    }

    /// Handles a deleted module file.
    pub fn remove_module(&self, path: &Path) {
        let Some(source) = module_source(path) else {
            return;
        };
        self.registry.remove_source(&source);
        self.retire(&source, None);
        info!("module {source} removed");
    }

    /// Swaps `replacement` in as the living library for `source`, moving
    /// the previous one to the retirement list.
    fn retire(&self, source: &str, replacement: Option<Library>) {
        let mut modules = self.modules.lock().expect("module table poisoned");
        let old = match replacement {
            Some(library) => modules.insert(source.to_owned(), library),
            None => modules.remove(source),
        };
        if let Some(old) = old {
            self.retired.lock().expect("retired table poisoned").push(old);
        }
    }

    /// Starts watching the base directory.
    ///
    /// Changed module files are reloaded in coalesced batches; after each
    /// batch, the [`MODULE_CHANGED`](hooks::MODULE_CHANGED) hook fires once
    /// per changed module with its absolute path.
    ///
    /// # Errors
    ///
    /// Returns an error if the watcher cannot be created or the base
    /// directory cannot be watched.
    pub fn watch(self: &Arc<Self>) -> Result<(), notify::Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(err) => warn!("module watcher error: {err}"),
            }
        })?;
        let mode = if self.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&self.base, mode)?;
        *self.watcher.lock().expect("watcher slot poisoned") = Some(watcher);

        let loader = Arc::clone(self);
        tokio::spawn(async move {
            loader.run_reloads(rx).await;
        });
        info!("watching {} for module changes", self.base.display());
        Ok(())
    }

    async fn run_reloads(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<PathBuf>) {
        let mut pending: RingQueue<PathBuf> = RingQueue::new();
        loop {
            match events.recv().await {
                Some(path) => {
                    if is_module_path(&path) {
                        pending.push_back(path);
                    }
                }
                None => break,
            }
            // Collect follow-up events until the directory has been quiet
            // for the whole window.
            loop {
                match tokio::time::timeout(RELOAD_QUIESCENCE, events.recv()).await {
                    Ok(Some(path)) => {
                        if is_module_path(&path) {
                            pending.push_back(path);
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            if pending.is_empty() {
                continue;
            }
            let mut batch: Vec<PathBuf> = Vec::new();
            while let Some(path) = pending.pop_front() {
                if !batch.contains(&path) {
                    batch.push(path);
                }
            }
            debug!("reloading {} changed module(s)", batch.len());
            for path in &batch {
                if path.exists() {
                    self.load_module(path);
                } else {
                    self.remove_module(path);
                }
            }
            for path in batch {
                let absolute = if path.is_absolute() {
                    path
                } else {
                    self.base.join(path)
                };
                self.registry.dispatch(
                    hooks::MODULE_CHANGED,
                    CategoryMask::ALL,
                    MatchMode::Inclusive,
                    HookArgs::ModuleChanged(Arc::new(absolute)),
                );
            }
        }
    }
}

impl Debug for Loader {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("base", &self.base)
            .field("recursive", &self.recursive)
            .finish()
    }
}

fn scan(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("cannot read module directory {}: {err}", dir.display());
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                scan(&path, recursive, out);
            }
        } else if is_module_path(&path) {
            out.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::hook_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn module_name(stem: &str) -> String {
        format!("{stem}.hook.{}", std::env::consts::DLL_EXTENSION)
    }

    #[test]
    fn source_identifier_from_path() {
        let path = PathBuf::from("/srv/hooks").join(module_name("example.com"));
        assert!(is_module_path(&path));
        assert_eq!(module_source(&path).unwrap(), "example.com");

        assert!(!is_module_path(Path::new("/srv/hooks/readme.txt")));
        assert!(module_source(Path::new("/srv/hooks/readme.txt")).is_none());
        // A bare suffix has no stem to use as a source.
        let bare = PathBuf::from("/srv/hooks").join(module_name(""));
        assert!(module_source(&bare).is_none());
    }

    #[test]
    fn garbage_module_contributes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(module_name("broken"));
        std::fs::write(&path, b"not a shared object").unwrap();

        let registry = Arc::new(Registry::new(false));
        let loader = Loader::new(dir.path().to_path_buf(), false, Arc::clone(&registry));
        loader.load_all();
        assert!(!registry.contains_chain("anything"));
    }

    #[test]
    fn scan_respects_recursion_flag() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join(module_name("top")), b"x").unwrap();
        std::fs::write(dir.path().join("sub").join(module_name("nested")), b"x").unwrap();

        let mut flat = Vec::new();
        scan(dir.path(), false, &mut flat);
        assert_eq!(flat.len(), 1);

        let mut deep = Vec::new();
        scan(dir.path(), true, &mut deep);
        assert_eq!(deep.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watcher_fires_module_changed() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(Registry::new(false));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        registry.register(
            HookFunction::from_declared(
                "builtin",
                &format!("hE_{}", hooks::MODULE_CHANGED),
                0,
                hook_fn(move |cx| {
                    let seen = Arc::clone(&seen_clone);
                    async move {
                        if let HookArgs::ModuleChanged(path) = &cx.args {
                            assert!(path.is_absolute());
                            assert!(is_module_path(path));
                            seen.fetch_add(1, Ordering::SeqCst);
                        }
                        None
                    }
                }),
            )
            .unwrap(),
        );

        let loader = Arc::new(Loader::new(
            dir.path().to_path_buf(),
            false,
            Arc::clone(&registry),
        ));
        loader.watch().unwrap();
        // Give the watcher a moment to register before producing events.
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(dir.path().join(module_name("site")), b"stub").unwrap();

        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("module change never observed");
    }
}
