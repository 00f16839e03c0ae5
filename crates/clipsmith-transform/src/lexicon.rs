//! English and German cue patterns.

use once_cell::sync::Lazy;
use regex::Regex;

// Compiled once, reused.
static OPEN_LOOP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?ix)
        \?[\s"'»«“”)]*$
        | \b(?:
            what\s+happened\s+here | what\s+does\s+that\s+mean | why
          | how\s+is\s+that\s+possible | the\s+question\s+is | guess\s+what
          | here'?s\s+the\s+thing
          | was\s+ist\s+hier\s+passiert | was\s+passiert\s+hier | was\s+bedeutet\s+das
          | warum | wie\s+kann\s+das\s+sein | die\s+frage\s+ist | stellt\s+sich\s+die\s+frage
          | was\s+ist\s+da\s+los | was\s+heißt\s+das | wie\s+ist\s+das\s+möglich
        )\b"#,
    )
    .unwrap()
});

static ANSWER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)
        \b(?:
            because | the\s+reason | the\s+answer | that\s+means | it\s+turns\s+out
          | that'?s\s+why | it\s+was | it\s+is | this\s+is
          | weil | der\s+grund | die\s+antwort | das\s+liegt\s+daran | das\s+bedeutet
          | passiert\s+ist | ist\s+ersetzt\s+worden | wurde\s+ersetzt
          | das\s+ist | das\s+war | es\s+war | es\s+ist
        )\b",
    )
    .unwrap()
});

static FILLER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)
        \b(?:
            ja\s+also | sozusagen | irgendwie | ähm | äh | also
          | you\s+know | i\s+mean | sort\s+of | kind\s+of | basically | um | uh | like
        )\b",
    )
    .unwrap()
});

/// Text ends on an unresolved question or names one.
pub fn is_open_loop(text: &str) -> bool {
    OPEN_LOOP_RE.is_match(text.trim())
}

/// Text resolves a question.
pub fn is_answer(text: &str) -> bool {
    ANSWER_RE.is_match(text)
}

pub fn count_fillers(text: &str) -> usize {
    FILLER_RE.find_iter(text).count()
}
