use crate::error::SetupError;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A sending identity: the envelope/auth address and its secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    pub address: String,
    pub secret: String,
}

impl Account {
    pub fn new<A: Into<String>, S: Into<String>>(address: A, secret: S) -> Self {
        Self {
            address: address.into(),
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Account")
            .field("address", &self.address)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Load an account file: one `address,secret` pair per line.
pub fn load_accounts(path: &Path) -> Result<Vec<Account>, SetupError> {
    let text = std::fs::read_to_string(path).map_err(|error| SetupError::ReadAccounts {
        path: path.to_path_buf(),
        error,
    })?;
    parse_accounts(path, &text)
}

pub fn parse_accounts(path: &Path, text: &str) -> Result<Vec<Account>, SetupError> {
    let mut accounts = vec![];
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 2 {
            return Err(SetupError::MalformedAccount {
                path: path.to_path_buf(),
                line: idx + 1,
                found: fields.len(),
            });
        }
        accounts.push(Account::new(fields[0].trim(), fields[1].trim()));
    }
    Ok(accounts)
}

/// Hands out accounts in round-robin order to concurrent callers.
///
/// When no accounts are configured, every call yields the
/// fallback identity and the cursor does not move.
#[derive(Debug)]
pub struct AccountRotator {
    accounts: Vec<Account>,
    fallback: Account,
    cursor: AtomicUsize,
}

impl AccountRotator {
    pub fn new(accounts: Vec<Account>, fallback: Account) -> Self {
        Self {
            accounts,
            fallback,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Claim the next slot, returning its index.
    /// The cursor only ever holds values in `[0, len)`, so the
    /// returned index is always valid.
    pub fn next_index(&self) -> Option<usize> {
        let len = self.accounts.len();
        if len == 0 {
            return None;
        }
        // fetch_update hands back the value it replaced
        self.cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |idx| {
                Some((idx + 1) % len)
            })
            .ok()
    }

    pub fn next(&self) -> &Account {
        match self.next_index() {
            Some(idx) => &self.accounts[idx],
            None => &self.fallback,
        }
    }
}
