//! Generation capability: prompt in, text out.
//!
//! Rather than embedding API keys or assuming a provider, generation
//! delegates to a user-configured command that accepts the prompt on stdin
//! and writes its response to stdout (e.g. `llm`, `ollama run`, a wrapper
//! script). The command is resolved from the `--lm` flag, falling back to
//! the `LEXMEMO_LM_COMMAND` environment variable.

use crate::error::{Error, Result};
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Instant;

/// Environment variable naming the generation command.
pub const LM_COMMAND_ENV: &str = "LEXMEMO_LM_COMMAND";

/// External text-generation capability. Opaque, potentially slow,
/// potentially failing; callers parse only what their prompt asked for.
pub trait Generator: Send + Sync {
    fn generate(&self, prompt: &str, max_output_chars: usize) -> Result<String>;
}

/// Generator backed by a user-configured command.
pub struct LmCommand {
    command: String,
}

impl LmCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Resolve the command from an explicit flag or the environment.
    pub fn resolve(flag: Option<&str>) -> Result<Self> {
        if let Some(command) = flag {
            return Ok(Self::new(command));
        }
        match std::env::var(LM_COMMAND_ENV) {
            Ok(command) if !command.trim().is_empty() => Ok(Self::new(command)),
            _ => Err(Error::Validation(format!(
                "no LM command configured (pass --lm or set {LM_COMMAND_ENV})"
            ))),
        }
    }
}

impl Generator for LmCommand {
    fn generate(&self, prompt: &str, max_output_chars: usize) -> Result<String> {
        let args = shell_words::split(&self.command)
            .map_err(|e| Error::Validation(format!("parse LM command: {e}")))?;
        if args.is_empty() {
            return Err(Error::Validation("LM command is empty".to_string()));
        }

        let start = Instant::now();
        let mut child = Command::new(&args[0])
            .args(&args[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ExternalCapability(format!("spawn {}: {e}", args[0])))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .map_err(|e| Error::ExternalCapability(format!("write LM prompt: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| Error::ExternalCapability(format!("wait for LM command: {e}")))?;

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            prompt_bytes = prompt.len(),
            response_bytes = output.stdout.len(),
            "lm invoke complete"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ExternalCapability(format!(
                "LM command failed with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8(output.stdout)
            .map_err(|e| Error::ExternalCapability(format!("decode LM stdout as UTF-8: {e}")))?;
        let mut text = strip_code_fences(&text).to_string();
        if text.len() > max_output_chars {
            let mut cut = max_output_chars;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        Ok(text)
    }
}

/// Strip a single surrounding markdown code fence, if present. LMs wrap
/// plain-text responses in fences often enough that callers should never
/// see them.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip an optional language identifier on the fence line.
    let body = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => return trimmed,
    };
    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(strip_code_fences("memo body"), "memo body");
    }

    #[test]
    fn fenced_text_is_unwrapped() {
        let text = "```text\nmemo body\n```";
        assert_eq!(strip_code_fences(text), "memo body");
    }

    #[test]
    fn fence_with_no_terminator_is_left_alone() {
        let text = "```\nunterminated";
        assert_eq!(strip_code_fences(text), text);
    }

    #[test]
    fn resolve_prefers_the_explicit_flag() {
        let lm = LmCommand::resolve(Some("cat")).unwrap();
        assert_eq!(lm.command, "cat");
    }
}
