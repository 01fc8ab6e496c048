//! # Shell Completion Module
//!
//! Completion scripts via `clap_complete`, plus dynamic completion of track
//! ids from the database for `track` and `similar`. The fish script asks
//! the hidden `complete-tracks` command for those ids.
//!
//! ```bash
//! wavehook completion bash > ~/.local/share/bash-completion/completions/wavehook
//! wavehook completion fish > ~/.config/fish/completions/wavehook.fish
//! ```

use crate::cli::Shell;
use crate::db::SqliteStore;
use anyhow::Result;
use clap::Command;
use clap_complete::{generate, Shell as CompletionShell};
use std::io::{self, Write};
use std::path::Path;

/// Track id completion for fish, appended to the generated script.
const FISH_TRACK_COMPLETION: &str = r#"
# Track ids from the database
function __wavehook_complete_tracks
    if command -sq wavehook
        wavehook complete-tracks 2>/dev/null
    end
end

complete -c wavehook -f -n '__fish_seen_subcommand_from track similar' -a '(__wavehook_complete_tracks)' -d 'Track id'
"#;

/// Write the completion script for `shell` to `out`, with track id
/// completion where the shell supports it.
pub fn write_completions<W: Write>(shell: Shell, cmd: &mut Command, out: &mut W) -> io::Result<()> {
    let name = cmd.get_name().to_string();
    generate(shell_to_completion_shell(shell), cmd, name, out);
    if shell == Shell::Fish {
        out.write_all(FISH_TRACK_COMPLETION.as_bytes())?;
    }
    out.flush()
}

pub fn shell_to_completion_shell(shell: Shell) -> CompletionShell {
    match shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    }
}

/// Track ids known to the database at `db_path`, sorted. A missing or
/// unreadable database yields no completions rather than an error.
pub fn get_track_completions(db_path: &Path) -> Vec<String> {
    if !db_path.exists() {
        return Vec::new();
    }
    let Ok(store) = SqliteStore::open(db_path) else {
        return Vec::new();
    };
    let mut ids: Vec<String> = store
        .load_tracks()
        .map(|tracks| tracks.into_iter().map(|t| t.id).collect())
        .unwrap_or_default();
    ids.sort();
    ids
}

pub fn print_track_completions(db_path: &Path) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for id in get_track_completions(db_path) {
        writeln!(out, "{id}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::Track;
    use tempfile::TempDir;

    #[test]
    fn test_shell_conversion() {
        assert_eq!(shell_to_completion_shell(Shell::Bash), CompletionShell::Bash);
        assert_eq!(shell_to_completion_shell(Shell::Zsh), CompletionShell::Zsh);
    }

    #[test]
    fn test_fish_script_completes_track_ids() {
        let mut cmd = Command::new("wavehook")
            .subcommand(Command::new("track"))
            .subcommand(Command::new("similar"));

        let mut fish = Vec::new();
        write_completions(Shell::Fish, &mut cmd, &mut fish).expect("write");
        let fish = String::from_utf8(fish).expect("utf-8");
        assert!(fish.contains("wavehook complete-tracks"));
        assert!(fish.contains("__fish_seen_subcommand_from track similar"));

        let mut bash = Vec::new();
        write_completions(Shell::Bash, &mut cmd, &mut bash).expect("write");
        let bash = String::from_utf8(bash).expect("utf-8");
        assert!(bash.contains("wavehook"));
        assert!(!bash.contains("complete-tracks"));
    }

    #[test]
    fn test_completions_without_database() {
        let dir = TempDir::new().expect("tempdir");
        assert!(get_track_completions(&dir.path().join("missing.db")).is_empty());
    }

    #[test]
    fn test_completions_list_sorted_ids() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("catalog.db");
        let store = SqliteStore::open(&path).expect("db");
        let tracks: Vec<Track> = ["b", "a"]
            .iter()
            .map(|id| Track {
                id: (*id).to_string(),
                ..Track::default()
            })
            .collect();
        store.upsert_tracks(&tracks).expect("insert");

        assert_eq!(get_track_completions(&path), vec!["a", "b"]);
    }
}
