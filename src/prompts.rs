//! Texts sent to agents: block seeds and the bootstrap sequence.

/// Initial content of the `architecture` block.
pub const ARCHITECTURE_SEED: &str =
    "Architecture notes will be filled in after the repository is indexed.";

/// Initial content of the `conventions` block.
pub const CONVENTIONS_SEED: &str =
    "Convention notes will be filled in after the repository is indexed.";

/// Default persona for an agent serving `repo_name`.
#[must_use]
pub fn default_persona(repo_name: &str) -> String {
    format!(
        "You are the resident expert on the `{repo_name}` repository. You have the \
         repository's files in your archival memory, refreshed after every commit. \
         Answer questions precisely, cite file paths, and say so when something is \
         not in the repository."
    )
}

/// The bootstrap messages, sent in order after the first full index.
///
/// Each asks the agent to study its archival memory and update one of its
/// fixed blocks.
#[must_use]
pub fn bootstrap_sequence(repo_name: &str) -> Vec<String> {
    vec![
        format!(
            "Study the `{repo_name}` files in your archival memory. Summarize the \
             system architecture (major components, how they interact, entry points) \
             and store the summary in your `architecture` memory block."
        ),
        format!(
            "Review the `{repo_name}` files again and distill the project's coding \
             conventions (naming, error handling, layout, test style) into your \
             `conventions` memory block."
        ),
    ]
}
