//! Process-wide protocol registry and session factory (spec.md §5 "one
//! `Engine` per process owns the compiled-protocol cache and the shared
//! arbiter"). Loads and caches compiled protocols by name, and hands out
//! [`Session`]s that all share one [`Arbiter`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::arbiter::{Arbiter, ChannelKey};
use crate::bridge::{ExecHost, RecordBridge};
use crate::bus::Bus;
use crate::error::{Error, Result};
use crate::format::ConverterRegistry;
use crate::protocol::{compiler, CompiledProtocol};
use crate::session::{Mode, Session};

/// Shared engine state: a protocol search path, a cache of compiled
/// protocols keyed by `"file:entry"`, a shared converter registry, and
/// the one [`Arbiter`] every session it creates contends through.
pub struct Engine {
    search_path: Vec<PathBuf>,
    protocols: Mutex<HashMap<String, Arc<CompiledProtocol>>>,
    converters: Arc<ConverterRegistry>,
    arbiter: Arc<Arbiter>,
}

impl Engine {
    pub fn new(search_path: Vec<PathBuf>) -> Self {
        Self {
            search_path,
            protocols: Mutex::new(HashMap::new()),
            converters: Arc::new(ConverterRegistry::with_builtins()),
            arbiter: Arc::new(Arbiter::new()),
        }
    }

    /// Builds an engine from the `STREAM_PROTOCOL_PATH` environment
    /// variable, a colon-separated list of directories (spec.md §6.1
    /// "protocol files are located via a search path"), mirroring
    /// EPICS's `STREAM_PROTOCOL_PATH` convention referenced in
    /// `original_source/`.
    pub fn from_env() -> Self {
        let path = std::env::var("STREAM_PROTOCOL_PATH").unwrap_or_default();
        let search_path = std::env::split_paths(&path).collect();
        Self::new(search_path)
    }

    pub fn register_converter(&mut self, conv: char, converter: Box<dyn crate::format::Converter>) {
        Arc::get_mut(&mut self.converters)
            .expect("register_converter must run before any session is created")
            .register(conv, converter);
    }

    /// Loads (and caches) the protocol named `entry` out of `file`,
    /// searching [`Engine::search_path`] if `file` is not found relative
    /// to the current directory.
    pub fn load_protocol(&self, file: &str, entry: &str) -> Result<Arc<CompiledProtocol>> {
        let cache_key = format!("{file}:{entry}");
        if let Some(cached) = self.protocols.lock().unwrap().get(&cache_key) {
            return Ok(cached.clone());
        }

        let path = self.resolve(file)?;
        let source = std::fs::read_to_string(&path)?;
        let compiled = Arc::new(compiler::compile(path.to_string_lossy().as_ref(), &source, entry)?);

        self.protocols
            .lock()
            .unwrap()
            .insert(cache_key, compiled.clone());
        Ok(compiled)
    }

    /// Drops a protocol from the cache so the next [`Engine::load_protocol`]
    /// re-reads and re-compiles it from disk (spec.md §5 "reload support").
    pub fn reload(&self, file: &str, entry: &str) {
        self.protocols.lock().unwrap().remove(&format!("{file}:{entry}"));
    }

    fn resolve(&self, file: &str) -> Result<PathBuf> {
        let direct = Path::new(file);
        if direct.is_file() {
            return Ok(direct.to_path_buf());
        }
        for dir in &self.search_path {
            let candidate = dir.join(file);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(Error::Other(format!("protocol file not found: {file}")))
    }

    /// Builds a session for `protocol` against `bus`, contending for
    /// `channel` at `priority` through this engine's shared arbiter.
    #[allow(clippy::too_many_arguments)]
    pub fn create_session(
        &self,
        protocol: Arc<CompiledProtocol>,
        channel: impl Into<ChannelKey>,
        priority: i32,
        mode: Mode,
        bus: Arc<dyn Bus>,
        bridge: Box<dyn RecordBridge>,
        exec_host: Option<Box<dyn ExecHost>>,
    ) -> Session {
        Session::new(
            protocol,
            channel,
            priority,
            mode,
            bus,
            self.arbiter.clone(),
            bridge,
            exec_host,
            self.converters.clone(),
        )
    }

    pub fn arbiter(&self) -> &Arc<Arbiter> {
        &self.arbiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_caches_the_compiled_protocol() {
        let dir = std::env::temp_dir().join(format!("streamcore-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("echo.proto");
        std::fs::write(&file, "echo { out \"Q\"; in \"A\"; }").unwrap();

        let engine = Engine::new(vec![]);
        let a = engine.load_protocol(file.to_str().unwrap(), "echo").unwrap();
        let b = engine.load_protocol(file.to_str().unwrap(), "echo").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        engine.reload(file.to_str().unwrap(), "echo");
        let c = engine.load_protocol(file.to_str().unwrap(), "echo").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_protocol_file_is_an_error() {
        let engine = Engine::new(vec![]);
        assert!(engine.load_protocol("does-not-exist.proto", "x").is_err());
    }
}
