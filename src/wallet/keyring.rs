// Keyring - the holder's keys, newest current, older ones kept for spending
// tokens that were issued to them

use crate::identity::{Keypair, OwnerCommitment, WalletAddress};
use crate::wallet::WalletError;

#[derive(Clone, Debug)]
struct KeyringEntry {
    label: String,
    keypair: Keypair,
    commitment: OwnerCommitment,
}

impl KeyringEntry {
    fn new(label: String, keypair: Keypair) -> Self {
        let commitment = keypair.owner_commitment();
        Self {
            label,
            keypair,
            commitment,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Keyring {
    entries: Vec<KeyringEntry>,
    current: usize,
}

impl Keyring {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            entries: vec![KeyringEntry::new(label_for(0), keypair)],
            current: 0,
        }
    }

    /// Rebuild a keyring from stored `(label, keypair)` pairs
    pub fn from_entries(entries: Vec<(String, Keypair)>, current_label: &str) -> Result<Self, WalletError> {
        let entries: Vec<KeyringEntry> = entries
            .into_iter()
            .map(|(label, keypair)| KeyringEntry::new(label, keypair))
            .collect();
        let current = entries
            .iter()
            .position(|e| e.label == current_label)
            .ok_or_else(|| WalletError::UnknownKey(current_label.to_string()))?;
        Ok(Self { entries, current })
    }

    pub fn current(&self) -> &Keypair {
        &self.entries[self.current].keypair
    }

    pub fn current_label(&self) -> &str {
        &self.entries[self.current].label
    }

    pub fn current_commitment(&self) -> &OwnerCommitment {
        &self.entries[self.current].commitment
    }

    pub fn address(&self) -> WalletAddress {
        self.current().address()
    }

    /// Add a fresh key and make it current; returns its label
    pub fn rotate(&mut self) -> String {
        self.rotate_to(Keypair::generate())
    }

    pub fn rotate_to(&mut self, keypair: Keypair) -> String {
        let label = label_for(self.entries.len());
        self.entries.push(KeyringEntry::new(label.clone(), keypair));
        self.current = self.entries.len() - 1;
        label
    }

    pub fn find(&self, commitment: &OwnerCommitment) -> Option<&Keypair> {
        self.entries
            .iter()
            .find(|e| &e.commitment == commitment)
            .map(|e| &e.keypair)
    }

    pub fn owns(&self, commitment: &OwnerCommitment) -> bool {
        self.entries.iter().any(|e| &e.commitment == commitment)
    }

    /// Commitments newest first
    pub fn commitments(&self) -> Vec<OwnerCommitment> {
        self.entries.iter().rev().map(|e| e.commitment).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Keypair)> {
        self.entries.iter().map(|e| (e.label.as_str(), &e.keypair))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn label_for(index: usize) -> String {
    format!("key-{}", index)
}
