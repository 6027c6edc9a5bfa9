//! Part handlers
//!
//! Normalized user-data parts are routed to handlers by content type. Every
//! handler sees `__begin__` before the first part and `__end__` after the
//! last one, and only receives parts its frequency allows for the walk.
//!
//! Builtin handlers are compiled in. Handlers supplied at runtime (from
//! `handler_dirs` or as `text/part-handler` parts) run as subprocesses, see
//! [`external`].

pub mod boot_hook;
pub mod cloud_config;
pub mod external;
pub mod shell_script;
pub mod upstart_job;

use crate::config::SystemConfig;
use crate::state::CloudPaths;
use crate::userdata::types::PART_HANDLER;
use crate::{CloudInitError, Frequency, Part};
use async_trait::async_trait;
use external::ExternalHandler;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Content type of the synthetic event sent before the first part
pub const BEGIN: &str = "__begin__";
/// Content type of the synthetic event sent after the last part
pub const END: &str = "__end__";

/// What a handler is being told
#[derive(Debug, Clone, Copy)]
pub enum PartEvent<'a> {
    Begin,
    Part(&'a Part),
    End,
}

impl PartEvent<'_> {
    /// Content type as handlers see it on the wire
    pub fn content_type(&self) -> &str {
        match self {
            Self::Begin => BEGIN,
            Self::Part(part) => &part.content_type,
            Self::End => END,
        }
    }
}

/// What handlers may touch
#[derive(Debug, Clone, Copy)]
pub struct HandlerContext<'a> {
    pub instance_id: &'a str,
    pub paths: &'a CloudPaths,
    pub config: &'a SystemConfig,
}

/// A user-data part handler
#[async_trait]
pub trait PartHandler: Send {
    /// Name used in logs and error reports
    fn name(&self) -> &str;

    /// Normalized content types this handler claims
    fn content_types(&self) -> Vec<String>;

    /// How often the handler wants to see parts
    fn frequency(&self) -> Frequency {
        Frequency::PerInstance
    }

    /// 1 = called without the walk frequency, 2 = called with it
    fn handler_version(&self) -> u8 {
        2
    }

    async fn handle_part(
        &mut self,
        ctx: &HandlerContext<'_>,
        event: PartEvent<'_>,
        frequency: Option<Frequency>,
    ) -> Result<(), CloudInitError>;
}

/// Registered handlers and the content types they own
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn PartHandler>>,
    by_type: HashMap<String, usize>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the compiled-in handlers
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(shell_script::ShellScriptHandler));
        registry.register(Box::new(cloud_config::CloudConfigHandler::new()));
        registry.register(Box::new(upstart_job::UpstartJobHandler));
        registry.register(Box::new(boot_hook::BootHookHandler));
        registry
    }

    /// Register a handler; it takes over every content type it claims
    ///
    /// Returns the handler's index.
    pub fn register(&mut self, handler: Box<dyn PartHandler>) -> usize {
        let idx = self.handlers.len();
        for ctype in handler.content_types() {
            if let Some(previous) = self.by_type.insert(ctype.clone(), idx) {
                debug!(
                    "{} replaces {} for {}",
                    handler.name(),
                    self.handlers[previous].name(),
                    ctype
                );
            }
        }
        debug!("Registered part handler {}", handler.name());
        self.handlers.push(handler);
        idx
    }

    /// Register every executable handler found in `dirs`
    ///
    /// Files that do not declare content types are skipped with a warning.
    pub async fn discover(&mut self, dirs: &[PathBuf]) -> Result<(), CloudInitError> {
        for dir in dirs {
            if !dir.is_dir() {
                debug!("Handler directory {} does not exist", dir.display());
                continue;
            }

            let mut files = Vec::new();
            let mut entries = fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    files.push(entry.path());
                }
            }
            files.sort();

            for path in files {
                match ExternalHandler::from_file(&path).await {
                    Ok(handler) => {
                        info!("Found custom part handler {}", path.display());
                        self.register(Box::new(handler));
                    }
                    Err(e) => warn!("Ignoring handler {}: {}", path.display(), e),
                }
            }
        }
        Ok(())
    }

    /// Index of the handler owning `content_type`
    pub fn lookup(&self, content_type: &str) -> Option<usize> {
        self.by_type.get(content_type).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Drives one walk over the normalized parts
pub struct Dispatcher<'a> {
    ctx: HandlerContext<'a>,
    registry: HandlerRegistry,
    installed: usize,
    errors: Vec<String>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(ctx: HandlerContext<'a>, registry: HandlerRegistry) -> Self {
        Self {
            ctx,
            registry,
            installed: 0,
            errors: Vec::new(),
        }
    }

    /// Walk `parts` at `frequency`
    ///
    /// Handler failures are logged and collected; the walk always finishes.
    /// Returns the collected errors.
    pub async fn walk(mut self, parts: &[Part], frequency: Frequency) -> Vec<String> {
        info!(
            "Dispatching {} part(s) at frequency {}",
            parts.len(),
            frequency
        );

        for idx in 0..self.registry.len() {
            self.call(idx, PartEvent::Begin, frequency).await;
        }

        for part in parts {
            if part.content_type == PART_HANDLER {
                self.install_part_handler(part, frequency).await;
                continue;
            }

            let Some(idx) = self.registry.lookup(&part.content_type) else {
                warn!(
                    "No handler for {} ({}), skipping",
                    part.content_type,
                    part.filename.as_deref().unwrap_or("unnamed")
                );
                continue;
            };

            let handler_freq = self.registry.handlers[idx].frequency();
            if handler_freq != Frequency::Always && handler_freq != frequency {
                debug!(
                    "Skipping {} for {}: handler frequency {} != walk frequency {}",
                    part.filename.as_deref().unwrap_or("unnamed"),
                    self.registry.handlers[idx].name(),
                    handler_freq,
                    frequency
                );
                continue;
            }

            self.call(idx, PartEvent::Part(part), frequency).await;
        }

        for idx in 0..self.registry.len() {
            self.call(idx, PartEvent::End, frequency).await;
        }

        self.errors
    }

    async fn call(&mut self, idx: usize, event: PartEvent<'_>, frequency: Frequency) {
        let handler = &mut self.registry.handlers[idx];
        let freq = (handler.handler_version() >= 2).then_some(frequency);
        if let Err(e) = handler.handle_part(&self.ctx, event, freq).await {
            warn!(
                "Handler {} failed on {}: {}",
                handler.name(),
                event.content_type(),
                e
            );
            self.errors.push(format!("{}: {}", handler.name(), e));
        }
    }

    /// Persist a `text/part-handler` part and bring it into the walk
    async fn install_part_handler(&mut self, part: &Part, frequency: Frequency) {
        let dir = self.ctx.paths.handlers_dir(self.ctx.instance_id);
        let path = dir.join(format!("part-handler-{:03}", self.installed));
        self.installed += 1;

        let handler = match write_executable(&dir, &path, &part.payload).await {
            Ok(()) => ExternalHandler::parse(&path, &part.payload),
            Err(e) => Err(e),
        };
        match handler {
            Ok(handler) => {
                info!("Installed part handler {}", path.display());
                let idx = self.registry.register(Box::new(handler));
                self.call(idx, PartEvent::Begin, frequency).await;
            }
            Err(e) => {
                warn!("Failed to install part handler {}: {}", path.display(), e);
                self.errors.push(format!("{}: {}", path.display(), e));
            }
        }
    }
}

/// Write `content` to `path` with mode 0755
async fn write_executable(dir: &Path, path: &Path, content: &[u8]) -> Result<(), CloudInitError> {
    fs::create_dir_all(dir).await?;
    fs::write(path, content).await?;
    set_mode(path, 0o755).await
}

pub(crate) async fn set_mode(path: &Path, mode: u32) -> Result<(), CloudInitError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

/// A part filename usable as a plain file name
pub fn safe_filename(name: Option<&str>, fallback: &str) -> String {
    let name = name
        .map(|n| n.rsplit(['/', '\\']).next().unwrap_or(n))
        .map(str::trim)
        .filter(|n| !n.is_empty() && *n != "." && *n != "..");
    match name {
        Some(n) => n
            .chars()
            .map(|c| if c.is_control() { '_' } else { c })
            .collect(),
        None => fallback.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records every event it sees
    struct Recorder {
        name: &'static str,
        types: Vec<String>,
        frequency: Frequency,
        version: u8,
        fail_on: Option<&'static str>,
        log: Log,
    }

    impl Recorder {
        fn new(name: &'static str, ctype: &str, log: &Log) -> Self {
            Self {
                name,
                types: vec![ctype.to_string()],
                frequency: Frequency::Always,
                version: 2,
                fail_on: None,
                log: Arc::clone(log),
            }
        }
    }

    #[async_trait]
    impl PartHandler for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn content_types(&self) -> Vec<String> {
            self.types.clone()
        }

        fn frequency(&self) -> Frequency {
            self.frequency
        }

        fn handler_version(&self) -> u8 {
            self.version
        }

        async fn handle_part(
            &mut self,
            _ctx: &HandlerContext<'_>,
            event: PartEvent<'_>,
            frequency: Option<Frequency>,
        ) -> Result<(), CloudInitError> {
            let what = match event {
                PartEvent::Part(part) => String::from_utf8_lossy(&part.payload).into_owned(),
                other => other.content_type().to_string(),
            };
            let freq = frequency.map(|f| f.to_string()).unwrap_or_else(|| "-".into());
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}:{}", self.name, what, freq));
            if self.fail_on == Some(event.content_type()) {
                return Err(CloudInitError::handler(self.name, "boom"));
            }
            Ok(())
        }
    }

    fn part(ctype: &str, payload: &str) -> Part {
        Part::new(ctype, payload)
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_begin_parts_end_order() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let config = SystemConfig::default();
        let ctx = HandlerContext {
            instance_id: "i-1",
            paths: &paths,
            config: &config,
        };
        let log = Log::default();

        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(Recorder::new("a", "text/a", &log)));
        registry.register(Box::new(Recorder::new("b", "text/b", &log)));

        let parts = vec![part("text/a", "one"), part("text/b", "two"), part("text/a", "three")];
        let errors = Dispatcher::new(ctx, registry)
            .walk(&parts, Frequency::PerInstance)
            .await;

        assert!(errors.is_empty());
        assert_eq!(
            entries(&log),
            vec![
                "a:__begin__:once-per-instance",
                "b:__begin__:once-per-instance",
                "a:one:once-per-instance",
                "b:two:once-per-instance",
                "a:three:once-per-instance",
                "a:__end__:once-per-instance",
                "b:__end__:once-per-instance",
            ]
        );
    }

    #[tokio::test]
    async fn test_frequency_gating() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let config = SystemConfig::default();
        let ctx = HandlerContext {
            instance_id: "i-1",
            paths: &paths,
            config: &config,
        };
        let log = Log::default();

        let mut once = Recorder::new("inst", "text/inst", &log);
        once.frequency = Frequency::PerInstance;
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(once));

        let parts = vec![part("text/inst", "payload")];
        Dispatcher::new(ctx, registry)
            .walk(&parts, Frequency::Always)
            .await;

        // Lifecycle events still arrive, the part does not
        assert_eq!(
            entries(&log),
            vec!["inst:__begin__:always", "inst:__end__:always"]
        );
    }

    #[tokio::test]
    async fn test_legacy_handler_gets_no_frequency() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let config = SystemConfig::default();
        let ctx = HandlerContext {
            instance_id: "i-1",
            paths: &paths,
            config: &config,
        };
        let log = Log::default();

        let mut legacy = Recorder::new("v1", "text/v1", &log);
        legacy.version = 1;
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(legacy));

        Dispatcher::new(ctx, registry)
            .walk(&[part("text/v1", "x")], Frequency::PerInstance)
            .await;
        assert_eq!(entries(&log)[1], "v1:x:-");
    }

    #[tokio::test]
    async fn test_later_registration_wins() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let config = SystemConfig::default();
        let ctx = HandlerContext {
            instance_id: "i-1",
            paths: &paths,
            config: &config,
        };
        let log = Log::default();

        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(Recorder::new("old", "text/x", &log)));
        registry.register(Box::new(Recorder::new("new", "text/x", &log)));

        Dispatcher::new(ctx, registry)
            .walk(&[part("text/x", "p")], Frequency::PerInstance)
            .await;
        let log = entries(&log);
        assert!(log.contains(&"new:p:once-per-instance".to_string()));
        assert!(!log.iter().any(|l| l.starts_with("old:p")));
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_walk() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let config = SystemConfig::default();
        let ctx = HandlerContext {
            instance_id: "i-1",
            paths: &paths,
            config: &config,
        };
        let log = Log::default();

        let mut flaky = Recorder::new("flaky", "text/f", &log);
        flaky.fail_on = Some("text/f");
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(flaky));
        registry.register(Box::new(Recorder::new("ok", "text/ok", &log)));

        let parts = vec![part("text/f", "bad"), part("text/unknown", "?"), part("text/ok", "good")];
        let errors = Dispatcher::new(ctx, registry)
            .walk(&parts, Frequency::PerInstance)
            .await;

        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("flaky"));
        assert!(entries(&log).contains(&"ok:good:once-per-instance".to_string()));
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename(Some("setup.sh"), "x"), "setup.sh");
        assert_eq!(safe_filename(Some("../../etc/passwd"), "x"), "passwd");
        assert_eq!(safe_filename(Some(".."), "part-001"), "part-001");
        assert_eq!(safe_filename(None, "part-002"), "part-002");
        assert_eq!(safe_filename(Some("a\nb"), "x"), "a_b");
    }
}
