mod file;
mod grep;
mod scope;
mod upgrade;

pub(super) use file::{snippet_from_file, SnippetFromFileParams};
pub(super) use grep::{snippets_from_grep, snippets_from_grep_filtered, GrepSnippetParams};
pub(super) use upgrade::{recall_upgrade_to_code_snippets, RecallCodeUpgradeParams};
