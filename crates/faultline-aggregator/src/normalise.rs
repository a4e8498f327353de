//! Backtrace normalisation for fingerprinting.
//!
//! Strips the parts of a backtrace that vary between occurrences of the same
//! defect (exception messages, load addresses, reflection trampolines) while
//! keeping every structural line in its original order.

use std::sync::LazyLock;

use regex::Regex;

/// Frame prefixes emitted by JVM reflection accessors. Their count and names
/// change between JVM versions for the same call site.
const REFLECTION_FRAME_PREFIXES: &[&str] = &["at sun.reflect.", "at jdk.internal.reflect."];

struct NormalisationPatterns {
    /// `Caused by: com.example.Foo: message` keeps `Caused by: com.example.Foo:`
    caused_by_message: Regex,
    /// `module.Error: message` at the start of a line keeps `module.Error: `
    leading_class_message: Regex,
    /// Native frame addresses: `0x0001a2b3 `
    native_address: Regex,
}

fn build_patterns() -> Option<NormalisationPatterns> {
    Some(NormalisationPatterns {
        caused_by_message: Regex::new(r"(Caused by: [^:]+:).*$").ok()?,
        leading_class_message: Regex::new(r"^([A-Za-z0-9_.$]+: ).*$").ok()?,
        native_address: Regex::new(r"0x[0-9a-f]{8} ").ok()?,
    })
}

#[allow(clippy::incompatible_msrv)]
static PATTERNS: LazyLock<Option<NormalisationPatterns>> = LazyLock::new(build_patterns);

/// Normalise a backtrace so that structurally identical failures produce
/// identical text.
///
/// Lines are processed independently and rejoined with `\n`:
/// - reflection trampoline frames are dropped
/// - `Caused by: <Class>: <message>` becomes `Caused by: <Class>:`
/// - `<Class>: <message>` at the start of a line becomes `<Class>: `
/// - an 8-digit hex address followed by a space becomes a single space
#[must_use]
pub fn normalise_backtrace(backtrace: &str) -> String {
    let Some(patterns) = PATTERNS.as_ref() else {
        return backtrace.to_owned();
    };

    backtrace
        .lines()
        .filter(|line| !is_reflection_frame(line))
        .map(|line| {
            let line = patterns.caused_by_message.replace(line, "$1");
            let line = patterns.leading_class_message.replace(&line, "$1");
            patterns.native_address.replace_all(&line, " ").into_owned()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_reflection_frame(line: &str) -> bool {
    let trimmed = line.trim_start();
    REFLECTION_FRAME_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
}
