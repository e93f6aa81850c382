use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use tufrepo_core::errors::{RepoError, Result};
use tufrepo_core::PasswordPrompt;

/// Reads passwords line by line from standard input.
pub struct StdinPrompt;

fn stdin_error(source: io::Error) -> RepoError {
    RepoError::Io { path: PathBuf::from("<stdin>"), source }
}

fn read_line(prompt: &str) -> Result<String> {
    eprint!("{prompt}");
    io::stderr().flush().map_err(stdin_error)?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).map_err(stdin_error)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

impl PasswordPrompt for StdinPrompt {
    fn get_password(&self, prompt: &str, confirm: bool) -> Result<String> {
        let password = read_line(prompt)?;
        if confirm && read_line("Confirm: ")? != password {
            return Err(stdin_error(io::Error::new(io::ErrorKind::InvalidInput, "passwords do not match")));
        }
        Ok(password)
    }
}
