//! The hook registry and executor.
//!
//! Hooks are named extension points. Every hook name owns a chain of
//! [`HookFunction`]s sorted ascending by priority; invoking the chain runs
//! the matching functions in order, threading the latest produced
//! [`Descriptor`] through as `last`.
//!
//! A function's execution policy and category mask are declared in its
//! name: `h` + policy letter (`S`ync, `A`sync, `E`vent, case-insensitive) +
//! zero or more category letters `A`–`Z` (none meaning *all categories*) +
//! `_` + the hook name itself. `hSA_example.com$blog` is a synchronous
//! function for category `A` under the hook name `example.com$blog`.
//!
//! Three invocation modes exist:
//! - [`Registry::call`] runs the whole chain, suspending at asynchronous
//!   functions until they resume their [`Continuation`], and delivers the
//!   final value to a callback from a spawned task, never from the caller's
//!   stack.
//! - [`Registry::call_sync`] runs inline and skips asynchronous functions.
//! - [`Registry::dispatch`] is fire-and-forget; results are discarded and
//!   nothing suspends.

use crate::application::ResponsePipe;
use crate::prelude::*;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Name of the built-in hook fired after each module reload batch, once per
/// changed module, with the module's absolute path.
pub const MODULE_CHANGED: &str = "onHookModuleChanged";

/// Boxed future returned by hook bodies.
pub type RetFut = Pin<Box<dyn Future<Output = Option<Descriptor>> + Send>>;
/// A hook body: user code producing an optional [`Descriptor`].
pub type HookFn = Arc<dyn Fn(HookContext) -> RetFut + Send + Sync>;

/// Wraps an async closure into a [`HookFn`].
pub fn hook_fn<F, Fut>(f: F) -> HookFn
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Descriptor>> + Send + 'static,
{
    Arc::new(move |cx| Box::pin(f(cx)))
}

/// When a hook function runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    /// Runs to completion; its return value replaces the chain value.
    Sync,
    /// Suspends the chain until its [`Continuation`] is resumed; the resume
    /// value replaces the chain value.
    Async,
    /// Runs to completion; the chain value is left untouched.
    Event,
}

impl Policy {
    /// Decodes the policy letter, case-insensitively.
    #[must_use]
    pub fn from_letter(letter: char) -> Option<Self> {
        Some(match letter.to_ascii_uppercase() {
            'S' => Self::Sync,
            'A' => Self::Async,
            'E' => Self::Event,
            _ => return None,
        })
    }

    /// The canonical (uppercase) policy letter.
    #[must_use]
    pub fn letter(self) -> char {
        match self {
            Self::Sync => 'S',
            Self::Async => 'A',
            Self::Event => 'E',
        }
    }
}

/// Which sites a hook function serves: one bit per letter `A`–`Z`.
///
/// A function declared without category letters gets [`CategoryMask::ALL`],
/// which matches every request under inclusive matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CategoryMask(pub u32);

impl CategoryMask {
    /// The all-categories sentinel, all bits set.
    pub const ALL: Self = Self(u32::MAX);

    /// The mask with only `letter`'s bit set.
    #[must_use]
    pub fn from_letter(letter: char) -> Option<Self> {
        if !letter.is_ascii_alphabetic() {
            return None;
        }
        Some(Self(1 << (letter.to_ascii_uppercase() as u32 - 'A' as u32)))
    }

    #[inline]
    #[must_use]
    pub fn is_all(self) -> bool {
        self == Self::ALL
    }

    /// The category letters of this mask, empty for [`Self::ALL`].
    #[must_use]
    pub fn letters(self) -> String {
        if self.is_all() {
            return String::new();
        }
        (0..26)
            .filter(|bit| self.0 & (1 << bit) != 0)
            .map(|bit| char::from(b'A' + bit as u8))
            .collect()
    }

    /// Whether a function carrying `self` participates in an invocation
    /// requesting `requested`.
    #[must_use]
    pub fn matches(self, requested: Self, mode: MatchMode) -> bool {
        match mode {
            MatchMode::Inclusive => self.0 & requested.0 != 0,
            MatchMode::Strict => self == requested,
        }
    }
}

/// How category masks are compared when assembling a chain invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Any overlapping bit includes the function; [`CategoryMask::ALL`]
    /// matches everything.
    Inclusive,
    /// Only an exactly equal mask includes the function.
    Strict,
}

/// A function name decoded per the naming grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedName {
    pub policy: Policy,
    pub mask: CategoryMask,
    /// The routing name, verbatim.
    pub name: String,
}

/// Decodes `h<Policy><Categories>_<name>`.
///
/// Returns [`None`] for names not following the grammar; such exports are
/// simply not hook functions.
#[must_use]
pub fn decode_name(declared: &str) -> Option<DecodedName> {
    let rest = declared.strip_prefix('h')?;
    let policy = Policy::from_letter(rest.chars().next()?)?;
    // The policy letter is ASCII, one byte.
    let rest = &rest[1..];
    let separator = rest.find('_')?;
    let (categories, name) = rest.split_at(separator);
    let name = &name[1..];
    if name.is_empty() {
        return None;
    }
    let mut bits = 0_u32;
    for letter in categories.chars() {
        bits |= CategoryMask::from_letter(letter)?.0;
    }
    let mask = if bits == 0 {
        CategoryMask::ALL
    } else {
        CategoryMask(bits)
    };
    Some(DecodedName {
        policy,
        mask,
        name: name.to_owned(),
    })
}

/// Re-encodes a decoded name. Round-trips with [`decode_name`].
#[must_use]
pub fn encode_name(policy: Policy, mask: CategoryMask, name: &str) -> String {
    let mut encoded = String::with_capacity(3 + name.len());
    encoded.push('h');
    encoded.push(policy.letter());
    encoded.push_str(&mask.letters());
    encoded.push('_');
    encoded.push_str(name);
    encoded
}

/// The pieces a delegated hook takes over: the raw request head, the
/// response pipe, and the descriptor which asked for delegation.
pub struct TakeoverParts {
    pub request: Request<()>,
    pub pipe: ResponsePipe,
    pub descriptor: Arc<Descriptor>,
}

/// Single-consumer cell for manual delegation; the first claimant wins.
pub struct Takeover {
    parts: Mutex<Option<TakeoverParts>>,
}

impl Takeover {
    #[must_use]
    pub fn new(parts: TakeoverParts) -> Self {
        Self {
            parts: Mutex::new(Some(parts)),
        }
    }

    /// Claims the connection. Later claims return [`None`].
    pub fn claim(&self) -> Option<TakeoverParts> {
        self.parts.lock().expect("takeover poisoned").take()
    }
}

impl Debug for Takeover {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("Takeover")
    }
}

/// Content-generation arguments, shared by every function of an invocation.
#[derive(Debug)]
pub struct RequestArgs {
    /// Request path; only set for site-default hooks, whose names do not
    /// encode the path.
    pub path: Option<String>,
    /// Query parameters, overridden by body parameters where both exist.
    pub params: HashMap<String, String>,
    /// Request headers.
    pub headers: HeaderMap,
    /// Collected request body.
    pub body: Bytes,
}

/// Arguments handed to every function in a chain invocation.
#[derive(Debug, Clone)]
pub enum HookArgs {
    /// No arguments.
    Empty,
    /// A routed request.
    Request(Arc<RequestArgs>),
    /// Absolute path of a reloaded module ([`MODULE_CHANGED`]).
    ModuleChanged(Arc<PathBuf>),
    /// Manual delegation of the client connection.
    Takeover(Arc<Takeover>),
}

impl HookArgs {
    #[must_use]
    pub fn request(args: RequestArgs) -> Self {
        Self::Request(Arc::new(args))
    }

    /// The request arguments, if this invocation routes a request.
    #[must_use]
    pub fn as_request(&self) -> Option<&RequestArgs> {
        match self {
            Self::Request(args) => Some(args),
            _ => None,
        }
    }
}

/// Resumes a suspended chain. Enforced once-only: every resume after the
/// first is a silent no-op, so a misbehaving hook cannot make the terminal
/// callback fire twice.
#[derive(Clone)]
pub struct Continuation {
    sender: Arc<Mutex<Option<oneshot::Sender<Option<Descriptor>>>>>,
}

impl Continuation {
    fn armed() -> (Self, oneshot::Receiver<Option<Descriptor>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// A continuation whose resumes all vanish; used outside suspending
    /// invocations.
    #[must_use]
    pub fn disarmed() -> Self {
        Self {
            sender: Arc::new(Mutex::new(None)),
        }
    }

    /// Resumes the chain with `value`. Returns whether this call was the
    /// one that resumed it.
    pub fn resume(&self, value: Option<Descriptor>) -> bool {
        match self.sender.lock().expect("continuation poisoned").take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }
}

impl Debug for Continuation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("Continuation")
    }
}

/// Everything a hook body receives.
#[derive(Debug)]
pub struct HookContext {
    /// Invocation arguments.
    pub args: HookArgs,
    /// The value produced by the functions before this one.
    pub last: Option<Arc<Descriptor>>,
    /// Resume handle; armed only for asynchronous functions in a
    /// suspending invocation.
    pub resume: Continuation,
}

/// A registered hook function: user code plus the metadata decoded from its
/// declared name and its module manifest.
pub struct HookFunction {
    /// Identifier of the module which declared the function.
    pub source: String,
    /// Routing name, verbatim from the declared name.
    pub name: String,
    pub mask: CategoryMask,
    /// Lower runs earlier. Order among equal priorities is unspecified.
    pub priority: i32,
    pub policy: Policy,
    body: HookFn,
}

impl HookFunction {
    #[must_use]
    pub fn new(source: impl Into<String>, decoded: DecodedName, priority: i32, body: HookFn) -> Self {
        Self {
            source: source.into(),
            name: decoded.name,
            mask: decoded.mask,
            priority,
            policy: decoded.policy,
            body,
        }
    }

    /// Builds a function from its declared name, or [`None`] if the name
    /// does not follow the grammar.
    #[must_use]
    pub fn from_declared(
        source: impl Into<String>,
        declared: &str,
        priority: i32,
        body: HookFn,
    ) -> Option<Self> {
        Some(Self::new(source, decode_name(declared)?, priority, body))
    }
}

impl Debug for HookFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookFunction")
            .field("source", &self.source)
            .field("name", &self.name)
            .field("mask", &self.mask)
            .field("priority", &self.priority)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Failure of a chain invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// A hook body panicked while safe hooks are disabled.
    HookFailed {
        source: String,
        name: String,
    },
    /// The executor task was torn down before delivering a result.
    Interrupted,
}

impl Display for ChainError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::HookFailed { source, name } => {
                write!(f, "hook function from {source:?} in chain {name:?} failed")
            }
            Self::Interrupted => f.write_str("chain invocation interrupted"),
        }
    }
}

impl std::error::Error for ChainError {}

/// The result a chain invocation settles on.
pub type ChainResult = Result<Option<Arc<Descriptor>>, ChainError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Call,
    CallSync,
    Dispatch,
}

/// All hook chains, indexed by hook name.
///
/// Mutated only by the module loader; every dispatch reads a snapshot of
/// the chain it invokes, so reloads swap chains atomically per name.
pub struct Registry {
    chains: DashMap<String, Vec<Arc<HookFunction>>>,
    safe_hooks: bool,
}

impl Registry {
    /// `safe_hooks` converts failing hook bodies into error descriptors
    /// instead of failing the whole invocation.
    #[must_use]
    pub fn new(safe_hooks: bool) -> Self {
        Self {
            chains: DashMap::new(),
            safe_hooks,
        }
    }

    /// Inserts `function` into its chain, replacing any function with the
    /// same `(source, name)` identity, and re-sorts the chain by priority.
    pub fn register(&self, function: HookFunction) {
        let mut chain = self.chains.entry(function.name.clone()).or_default();
        chain.retain(|existing| existing.source != function.source);
        chain.push(Arc::new(function));
        chain.sort_by_key(|f| f.priority);
    }

    /// Removes every function declared by `source`. Emptied chains remain,
    /// distinguishable from never-created ones.
    pub fn remove_source(&self, source: &str) {
        for mut chain in self.chains.iter_mut() {
            chain.retain(|f| f.source != source);
        }
    }

    /// Whether a chain was ever created under `name`, even if empty.
    #[must_use]
    pub fn contains_chain(&self, name: &str) -> bool {
        self.chains.contains_key(name)
    }

    /// Whether the chain exists and at least one function matches `mask`.
    #[must_use]
    pub fn check_target(&self, name: &str, mask: CategoryMask, mode: MatchMode) -> bool {
        self.chains
            .get(name)
            .map_or(false, |chain| chain.iter().any(|f| f.mask.matches(mask, mode)))
    }

    fn snapshot(&self, name: &str) -> Vec<Arc<HookFunction>> {
        self.chains
            .get(name)
            .map(|chain| chain.value().clone())
            .unwrap_or_default()
    }

    /// Runs the chain, suspending at asynchronous functions, and delivers
    /// the final value to `callback`.
    ///
    /// The chain and the callback run on a spawned task; the callback never
    /// executes on the caller's stack.
    pub fn call(
        &self,
        name: &str,
        mask: CategoryMask,
        mode: MatchMode,
        args: HookArgs,
        callback: impl FnOnce(ChainResult) + Send + 'static,
    ) {
        let functions = self.snapshot(name);
        let safe = self.safe_hooks;
        tokio::spawn(async move {
            let result = drive(functions, mask, mode, Mode::Call, args, safe).await;
            callback(result);
        });
    }

    /// [`call`](Self::call), but awaitable.
    pub async fn call_wait(
        &self,
        name: &str,
        mask: CategoryMask,
        mode: MatchMode,
        args: HookArgs,
    ) -> ChainResult {
        let (tx, rx) = oneshot::channel();
        self.call(name, mask, mode, args, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(ChainError::Interrupted))
    }

    /// Runs the chain inline, skipping asynchronous functions, and returns
    /// the final value directly.
    pub async fn call_sync(
        &self,
        name: &str,
        mask: CategoryMask,
        mode: MatchMode,
        args: HookArgs,
    ) -> ChainResult {
        let functions = self.snapshot(name);
        drive(functions, mask, mode, Mode::CallSync, args, self.safe_hooks).await
    }

    /// Fire-and-forget invocation. Asynchronous functions get a disarmed
    /// continuation and nothing suspends; all results are discarded.
    pub fn dispatch(&self, name: &str, mask: CategoryMask, mode: MatchMode, args: HookArgs) {
        let functions = self.snapshot(name);
        let safe = self.safe_hooks;
        let name = name.to_owned();
        tokio::spawn(async move {
            if let Err(err) = drive(functions, mask, mode, Mode::Dispatch, args, safe).await {
                warn!("dispatched chain {name:?} failed: {err}");
            }
        });
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("chains", &self.chains.len())
            .field("safe_hooks", &self.safe_hooks)
            .finish()
    }
}

/// Runs the matching functions of a chain in priority order.
///
/// Each function observes the value its predecessors settled on. Functions
/// run on their own task so a panicking body is contained: with safe hooks
/// it terminates the chain with an error descriptor, without it fails the
/// invocation.
async fn drive(
    functions: Vec<Arc<HookFunction>>,
    mask: CategoryMask,
    match_mode: MatchMode,
    mode: Mode,
    args: HookArgs,
    safe: bool,
) -> ChainResult {
    let mut last: Option<Arc<Descriptor>> = None;
    for function in functions
        .into_iter()
        .filter(|f| f.mask.matches(mask, match_mode))
    {
        if mode == Mode::CallSync && function.policy == Policy::Async {
            continue;
        }

        let (resume, receiver) = if function.policy == Policy::Async && mode == Mode::Call {
            let (resume, rx) = Continuation::armed();
            (resume, Some(rx))
        } else {
            (Continuation::disarmed(), None)
        };

        let context = HookContext {
            args: args.clone(),
            last: last.clone(),
            resume,
        };
        let future = (function.body)(context);
        let returned = match tokio::spawn(future).await {
            Ok(value) => value,
            Err(failure) => {
                error!(
                    "hook function {:?} from {:?} {}",
                    function.name,
                    function.source,
                    if failure.is_panic() {
                        "panicked"
                    } else {
                        "was cancelled"
                    }
                );
                if safe {
                    last = Some(Arc::new(Descriptor::internal_error()));
                    break;
                }
                return Err(ChainError::HookFailed {
                    source: function.source.clone(),
                    name: function.name.clone(),
                });
            }
        };

        match function.policy {
            Policy::Sync => {
                if mode != Mode::Dispatch {
                    last = returned.map(Arc::new);
                }
            }
            Policy::Event => {}
            Policy::Async => {
                if let Some(receiver) = receiver {
                    match receiver.await {
                        Ok(value) => last = value.map(Arc::new),
                        Err(_) => {
                            // Completed without ever resuming; carry the
                            // previous value forward.
                            warn!(
                                "hook function {:?} from {:?} dropped its continuation",
                                function.name, function.source
                            );
                        }
                    }
                }
            }
        }
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn mask(letter: char) -> CategoryMask {
        CategoryMask::from_letter(letter).unwrap()
    }

    #[test]
    fn decode_basics() {
        let decoded = decode_name("hSA_example.com$blog/post").unwrap();
        assert_eq!(decoded.policy, Policy::Sync);
        assert_eq!(decoded.mask, mask('A'));
        assert_eq!(decoded.name, "example.com$blog/post");

        let decoded = decode_name("haBC_x").unwrap();
        assert_eq!(decoded.policy, Policy::Async);
        assert_eq!(decoded.mask, CategoryMask(0b110));

        let decoded = decode_name("hE_onHookModuleChanged").unwrap();
        assert_eq!(decoded.policy, Policy::Event);
        assert!(decoded.mask.is_all());
    }

    #[test]
    fn decode_case_insensitive_letters() {
        let lower = decode_name("hsab_x").unwrap();
        let upper = decode_name("hSAB_x").unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn decode_rejects_malformed() {
        assert!(decode_name("x").is_none());
        assert!(decode_name("hX_name").is_none());
        assert!(decode_name("hS").is_none());
        assert!(decode_name("hSA_").is_none());
        assert!(decode_name("hS1_name").is_none());
        assert!(decode_name("helper").is_none());
    }

    #[test]
    fn name_round_trip() {
        for declared in ["hS_plain", "hAQ_site$", "hEABZ_site$deep/path", "hS_under_scored"] {
            let decoded = decode_name(declared).unwrap();
            let encoded = encode_name(decoded.policy, decoded.mask, &decoded.name);
            assert_eq!(decode_name(&encoded).unwrap(), decoded);
        }
        // Canonical form uppercases the letters.
        let decoded = decode_name("hsa_x").unwrap();
        assert_eq!(encode_name(decoded.policy, decoded.mask, &decoded.name), "hSA_x");
    }

    #[test]
    fn mask_matching_modes() {
        // Masks 0b001, 0b010, 0b011 and the sentinel against request 0b001.
        let requested = CategoryMask(0b001);
        let members = [
            CategoryMask(0b001),
            CategoryMask(0b010),
            CategoryMask(0b011),
            CategoryMask::ALL,
        ];
        let inclusive: Vec<_> = members
            .iter()
            .filter(|m| m.matches(requested, MatchMode::Inclusive))
            .collect();
        assert_eq!(inclusive.len(), 3);
        assert!(!CategoryMask(0b010).matches(requested, MatchMode::Inclusive));
        let strict: Vec<_> = members
            .iter()
            .filter(|m| m.matches(requested, MatchMode::Strict))
            .collect();
        assert_eq!(strict, vec![&CategoryMask(0b001)]);
    }

    fn recording_hook(log: Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> HookFn {
        hook_fn(move |cx| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(tag);
                drop(cx);
                None
            }
        })
    }

    fn registry_with(functions: Vec<HookFunction>) -> Registry {
        let registry = Registry::new(false);
        for function in functions {
            registry.register(function);
        }
        registry
    }

    #[tokio::test]
    async fn chain_runs_in_priority_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(vec![
            HookFunction::from_declared("m1", "hS_t", 10, recording_hook(log.clone(), "late"))
                .unwrap(),
            HookFunction::from_declared("m2", "hS_t", -5, recording_hook(log.clone(), "early"))
                .unwrap(),
            HookFunction::from_declared("m3", "hS_t", 0, recording_hook(log.clone(), "middle"))
                .unwrap(),
        ]);
        registry
            .call_wait("t", CategoryMask::ALL, MatchMode::Inclusive, HookArgs::Empty)
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["early", "middle", "late"]);
    }

    #[tokio::test]
    async fn sync_replaces_event_preserves() {
        let registry = registry_with(vec![
            HookFunction::from_declared(
                "m",
                "hS_t",
                0,
                hook_fn(|_| async { Some(Descriptor::new(201)) }),
            )
            .unwrap(),
            HookFunction::from_declared(
                "m2",
                "hE_t",
                1,
                hook_fn(|cx| async move {
                    // An event function sees the value but cannot change it.
                    assert_eq!(cx.last.as_ref().unwrap().status, 201);
                    Some(Descriptor::new(599))
                }),
            )
            .unwrap(),
        ]);
        let result = registry
            .call_wait("t", CategoryMask::ALL, MatchMode::Inclusive, HookArgs::Empty)
            .await
            .unwrap();
        assert_eq!(result.unwrap().status, 201);
    }

    #[tokio::test]
    async fn async_continuation_value_becomes_last() {
        let registry = registry_with(vec![HookFunction::from_declared(
            "m",
            "hA_t",
            0,
            hook_fn(|cx| async move {
                let resume = cx.resume.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    resume.resume(Some(Descriptor::new(206)));
                });
                None
            }),
        )
        .unwrap()]);
        let result = registry
            .call_wait("t", CategoryMask::ALL, MatchMode::Inclusive, HookArgs::Empty)
            .await
            .unwrap();
        assert_eq!(result.unwrap().status, 206);
    }

    #[tokio::test]
    async fn call_sync_skips_async_functions() {
        let touched = Arc::new(AtomicBool::new(false));
        let touched_clone = Arc::clone(&touched);
        let registry = registry_with(vec![
            HookFunction::from_declared(
                "m",
                "hA_t",
                0,
                hook_fn(move |_| {
                    let touched = Arc::clone(&touched_clone);
                    async move {
                        touched.store(true, Ordering::SeqCst);
                        None
                    }
                }),
            )
            .unwrap(),
            HookFunction::from_declared(
                "m2",
                "hS_t",
                1,
                hook_fn(|_| async { Some(Descriptor::new(200)) }),
            )
            .unwrap(),
        ]);
        let result = registry
            .call_sync("t", CategoryMask::ALL, MatchMode::Inclusive, HookArgs::Empty)
            .await
            .unwrap();
        assert_eq!(result.unwrap().status, 200);
        assert!(!touched.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dispatch_discards_results_and_never_suspends() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        let registry = registry_with(vec![HookFunction::from_declared(
            "m",
            "hA_t",
            0,
            hook_fn(move |cx| {
                let ran = Arc::clone(&ran_clone);
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    // Never resumed; dispatch must not hang on this.
                    drop(cx);
                    None
                }
            }),
        )
        .unwrap()]);
        registry.dispatch("t", CategoryMask::ALL, MatchMode::Inclusive, HookArgs::Empty);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn continuation_resumes_once_only() {
        let (resume, rx) = Continuation::armed();
        assert!(resume.resume(Some(Descriptor::new(200))));
        assert!(!resume.resume(Some(Descriptor::new(500))));
        let value = rx.await.unwrap();
        assert_eq!(value.unwrap().status, 200);
        assert!(!Continuation::disarmed().resume(None));
    }

    #[tokio::test]
    async fn terminal_callback_is_deferred() {
        let registry = registry_with(vec![HookFunction::from_declared(
            "m",
            "hS_t",
            0,
            hook_fn(|_| async { Some(Descriptor::new(200)) }),
        )
        .unwrap()]);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        let (tx, rx) = oneshot::channel();
        registry.call(
            "t",
            CategoryMask::ALL,
            MatchMode::Inclusive,
            HookArgs::Empty,
            move |result| {
                fired_clone.store(true, Ordering::SeqCst);
                let _ = tx.send(result);
            },
        );
        // Synchronously after the call, nothing has run yet.
        assert!(!fired.load(Ordering::SeqCst));
        let result = rx.await.unwrap().unwrap();
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(result.unwrap().status, 200);
    }

    #[tokio::test]
    async fn safe_hooks_convert_panics() {
        let registry = Registry::new(true);
        registry.register(
            HookFunction::from_declared(
                "m",
                "hS_t",
                0,
                hook_fn(|_| async { panic!("boom") }),
            )
            .unwrap(),
        );
        let result = registry
            .call_wait("t", CategoryMask::ALL, MatchMode::Inclusive, HookArgs::Empty)
            .await
            .unwrap();
        let descriptor = result.unwrap();
        assert!(descriptor.error);
    }

    #[tokio::test]
    async fn unsafe_hooks_fail_the_invocation() {
        let registry = Registry::new(false);
        registry.register(
            HookFunction::from_declared(
                "m",
                "hS_t",
                0,
                hook_fn(|_| async { panic!("boom") }),
            )
            .unwrap(),
        );
        let result = registry
            .call_wait("t", CategoryMask::ALL, MatchMode::Inclusive, HookArgs::Empty)
            .await;
        assert!(matches!(result, Err(ChainError::HookFailed { .. })));
    }

    #[tokio::test]
    async fn reload_replaces_by_source_identity() {
        let registry = Registry::new(false);
        registry.register(
            HookFunction::from_declared(
                "mod",
                "hS_t",
                0,
                hook_fn(|_| async { Some(Descriptor::new(200)) }),
            )
            .unwrap(),
        );
        registry.register(
            HookFunction::from_declared(
                "mod",
                "hS_t",
                0,
                hook_fn(|_| async { Some(Descriptor::new(204)) }),
            )
            .unwrap(),
        );
        let result = registry
            .call_wait("t", CategoryMask::ALL, MatchMode::Inclusive, HookArgs::Empty)
            .await
            .unwrap();
        assert_eq!(result.unwrap().status, 204);
    }

    #[test]
    fn empty_chain_is_distinct_from_missing() {
        let registry = Registry::new(false);
        registry.register(
            HookFunction::from_declared("mod", "hS_t", 0, hook_fn(|_| async { None })).unwrap(),
        );
        registry.remove_source("mod");
        assert!(registry.contains_chain("t"));
        assert!(!registry.contains_chain("missing"));
        assert!(!registry.check_target("t", CategoryMask::ALL, MatchMode::Inclusive));
        assert!(!registry.check_target("missing", CategoryMask::ALL, MatchMode::Inclusive));
    }

    #[test]
    fn check_target_respects_match_mode() {
        let registry = Registry::new(false);
        registry.register(
            HookFunction::from_declared("mod", "hSB_t", 0, hook_fn(|_| async { None })).unwrap(),
        );
        assert!(registry.check_target("t", mask('B'), MatchMode::Inclusive));
        assert!(registry.check_target("t", mask('B'), MatchMode::Strict));
        assert!(!registry.check_target("t", mask('A'), MatchMode::Inclusive));
        assert!(!registry.check_target("t", CategoryMask(0b11), MatchMode::Strict));
    }
}
