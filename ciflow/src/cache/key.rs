//! Cache key templating and content hashing.
//!
//! A raw key may embed `${...}` expressions, resolved remotely first, and
//! handlebars helpers, rendered locally:
//!
//! | Helper                 | Renders                                 |
//! |------------------------|-----------------------------------------|
//! | `{{ checksum "path" }}`| hex MD5 of the file, relative to work dir |
//! | `{{ epoch }}`          | current Unix time in seconds            |
//! | `{{ arch }}`           | CPU architecture (`amd64`, `arm64`, ...) |
//! | `{{ os }}`             | operating system (`linux`, `darwin`, ...) |
//!
//! Call syntax `{{ checksum("path") }}` is accepted as well.

use crate::core::StageOutput;
use crate::errors::EngineError;
use crate::remote::{resolve_embedded, ExpressionEvaluator};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext, RenderError,
};
use md5::{Digest, Md5};
use regex::Regex;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

/// Object metadata key holding the base64 MD5 of a cache archive.
pub const CONTENT_HASH_METADATA_KEY: &str = "content-md5";

/// `{{ name(args) }}` call syntax, rewritten to `{{ name args }}`.
static CALL_SYNTAX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*(?P<name>[A-Za-z_]\w*)\s*\((?P<args>[^()}]*)\)\s*\}\}")
        .expect("call syntax pattern is valid")
});

/// Resolves a raw cache key into its final form.
///
/// Embedded expressions are resolved through `evaluator` and substituted
/// back before the template is rendered.
pub async fn resolve_key(
    evaluator: &dyn ExpressionEvaluator,
    step_id: &str,
    raw_key: &str,
    stage_output: &StageOutput,
    work_dir: &Path,
) -> Result<String, EngineError> {
    let expanded = resolve_embedded(evaluator, step_id, raw_key, stage_output).await?;
    let key = render_key(&expanded, work_dir)?;
    debug!(step_id, key = %key, "Resolved cache key");
    Ok(key)
}

/// Renders the template helpers in `template`.
///
/// Unknown helpers, bad arguments and unterminated `{{` are template errors,
/// as is a key that renders empty.
pub fn render_key(template: &str, work_dir: &Path) -> Result<String, EngineError> {
    let template = CALL_SYNTAX.replace_all(template, "{{ ${name} ${args} }}");
    let key = key_templates(work_dir)
        .render_template(&template, &())
        .map_err(|e| EngineError::Template(e.to_string()))?;

    if key.trim().is_empty() {
        return Err(EngineError::Template("cache key is empty".to_string()));
    }
    Ok(key)
}

/// Registry with the key helpers, reading checksummed files from `work_dir`.
fn key_templates(work_dir: &Path) -> Handlebars<'static> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(handlebars::no_escape);

    handlebars.register_helper(
        "checksum",
        Box::new(ChecksumHelper {
            work_dir: work_dir.to_path_buf(),
        }),
    );
    handlebars.register_helper("epoch", Box::new(epoch_helper));
    handlebars.register_helper("arch", Box::new(arch_helper));
    handlebars.register_helper("os", Box::new(os_helper));
    handlebars
}

struct ChecksumHelper {
    work_dir: PathBuf,
}

impl HelperDef for ChecksumHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'reg, 'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        if h.params().len() != 1 {
            return Err(RenderError::new("checksum expects a single quoted path"));
        }
        let path = h
            .param(0)
            .and_then(|p| p.value().as_str())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| RenderError::new("checksum expects a quoted path"))?;

        let sum =
            checksum(&self.work_dir.join(path)).map_err(|e| RenderError::new(e.to_string()))?;
        out.write(&sum)?;
        Ok(())
    }
}

fn no_params(h: &Helper<'_, '_>) -> Result<(), RenderError> {
    if h.params().is_empty() && h.hash().is_empty() {
        Ok(())
    } else {
        Err(RenderError::new(format!("{} takes no arguments", h.name())))
    }
}

fn epoch_helper(
    h: &Helper<'_, '_>,
    _: &Handlebars<'_>,
    _: &Context,
    _: &mut RenderContext<'_, '_>,
    out: &mut dyn Output,
) -> HelperResult {
    no_params(h)?;
    out.write(&chrono::Utc::now().timestamp().to_string())?;
    Ok(())
}

fn arch_helper(
    h: &Helper<'_, '_>,
    _: &Handlebars<'_>,
    _: &Context,
    _: &mut RenderContext<'_, '_>,
    out: &mut dyn Output,
) -> HelperResult {
    no_params(h)?;
    out.write(arch())?;
    Ok(())
}

fn os_helper(
    h: &Helper<'_, '_>,
    _: &Handlebars<'_>,
    _: &Context,
    _: &mut RenderContext<'_, '_>,
    out: &mut dyn Output,
) -> HelperResult {
    no_params(h)?;
    out.write(os())?;
    Ok(())
}

/// Hex MD5 of a file, as rendered by `{{ checksum }}`.
pub fn checksum(path: &Path) -> Result<String, EngineError> {
    file_md5(path)
        .map(hex::encode)
        .map_err(|e| EngineError::Template(format!("checksum {}: {e}", path.display())))
}

/// Base64 MD5 of a file, as stored under [`CONTENT_HASH_METADATA_KEY`].
pub fn content_hash(path: &Path) -> Result<String, EngineError> {
    Ok(STANDARD.encode(file_md5(path)?))
}

/// [`content_hash`] on a blocking thread.
pub async fn content_hash_blocking(path: PathBuf) -> Result<String, EngineError> {
    tokio::task::spawn_blocking(move || content_hash(&path))
        .await
        .map_err(|e| EngineError::Join(e.to_string()))?
}

fn file_md5(path: &Path) -> io::Result<[u8; 16]> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Md5::new();
    io::copy(&mut reader, &mut hasher)?;
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

/// CPU architecture of this process, in Go's naming.
#[must_use]
pub fn arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64",
        "loongarch64" => "loong64",
        other => other,
    }
}

/// Operating system of this process, in Go's naming.
#[must_use]
pub fn os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}
