//! Runtime variant selection and run specification building.
//!
//! Turns the caller's selection (a list of variant ids, or "all") into the
//! immutable list of [`RunSpecification`]s handed to the orchestrator.
//!
//! Variant ids are resolved against the configured catalogue first. A bare
//! version such as `22` is shorthand for `nodejs:22`, and a `nodejs:<v>` id
//! that is not in the catalogue maps to the public Lambda base image for that
//! version.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::VariantConfig;
use crate::run::RunSpecification;

/// Registry prefix for the public AWS Lambda base images.
pub const LAMBDA_IMAGE_PREFIX: &str = "public.ecr.aws/lambda/";

/// Prefix of every container name this tool creates.
pub const NAME_PREFIX: &str = "lth";

static UNSAFE_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.-]").expect("valid regex"));

/// Errors while resolving a variant selection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VariantError {
    #[error("unknown runtime variant '{0}'")]
    Unknown(String),

    #[error("no runtime variants selected")]
    Empty,
}

/// Replaces every character Docker does not allow in container names with
/// `_`.
///
/// ```
/// use lambda_harness::variant::sanitize_name;
///
/// assert_eq!(sanitize_name("nodejs:20"), "nodejs_20");
/// assert_eq!(sanitize_name("registry/node:lts"), "registry_node_lts");
/// ```
pub fn sanitize_name(raw: &str) -> String {
    UNSAFE_NAME_CHARS.replace_all(raw, "_").into_owned()
}

/// Container name for the run at `index` of a batch.
pub fn container_name(variant_id: &str, index: usize) -> String {
    format!("{}-{}-{}", NAME_PREFIX, sanitize_name(variant_id), index)
}

/// Expands `22` to `nodejs:22`; other ids are returned unchanged.
fn normalize_id(requested: &str) -> String {
    let requested = requested.trim();
    if requested.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        format!("nodejs:{}", requested)
    } else {
        requested.to_string()
    }
}

/// Resolves the requested variant ids against the known catalogue.
///
/// With `all` set, every known variant is returned and `requested` is
/// ignored. Duplicates are dropped, keeping first-seen order.
pub fn resolve_variants(
    requested: &[String],
    known: &[VariantConfig],
    all: bool,
) -> Result<Vec<VariantConfig>, VariantError> {
    let selected = if all {
        known.to_vec()
    } else {
        let mut selected: Vec<VariantConfig> = Vec::new();
        for raw in requested {
            let id = normalize_id(raw);
            if selected.iter().any(|v| v.id == id) {
                continue;
            }

            let variant = match known.iter().find(|v| v.id == id) {
                Some(v) => v.clone(),
                None if id.starts_with("nodejs:") => VariantConfig {
                    image: format!("{}{}", LAMBDA_IMAGE_PREFIX, id),
                    id,
                },
                None => return Err(VariantError::Unknown(raw.clone())),
            };
            selected.push(variant);
        }
        selected
    };

    if selected.is_empty() {
        return Err(VariantError::Empty);
    }
    Ok(selected)
}

/// Builds one specification per variant, in variant order.
///
/// Names are derived from the variant id and the batch index, so two
/// variants can never collide within a batch.
pub fn build_specifications(
    variants: &[VariantConfig],
    code_path: &Path,
    test_command: &[String],
    env: &[(String, String)],
) -> Vec<RunSpecification> {
    variants
        .iter()
        .enumerate()
        .map(|(index, variant)| {
            let mut spec = RunSpecification::new(&variant.image, container_name(&variant.id, index))
                .variant(&variant.id)
                .code_path(code_path)
                .test_command(test_command.iter().cloned());
            spec.env = env.to_vec();
            spec
        })
        .collect()
}

/// Splits a shell-style command line into an argument vector.
pub fn parse_test_command(command: &str) -> Result<Vec<String>, shell_words::ParseError> {
    shell_words::split(command)
}
