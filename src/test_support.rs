use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::model::{dwc, CompositeKey, Identifier, OccurrenceRecord};
use crate::store::{KeyStore, MemoryKeyStore, PutOutcome, StoreError};

/// Store wrapper counting successful writes, with an optional delay before
/// each conditional put to widen race windows.
#[derive(Debug, Default)]
pub struct CountingKeyStore<S = MemoryKeyStore> {
    inner: S,
    puts: AtomicUsize,
    deletes: AtomicUsize,
    put_delay: Option<Duration>,
}

impl CountingKeyStore<MemoryKeyStore> {
    pub fn in_memory() -> Self {
        Self::wrap(MemoryKeyStore::new())
    }
}

impl<S: KeyStore> CountingKeyStore<S> {
    pub fn wrap(inner: S) -> Self {
        Self {
            inner,
            puts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            put_delay: None,
        }
    }

    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = Some(delay);
        self
    }

    /// Conditional puts that actually inserted.
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

impl<S: KeyStore> KeyStore for CountingKeyStore<S> {
    fn get(&self, key: &CompositeKey) -> Result<Option<Identifier>, StoreError> {
        self.inner.get(key)
    }

    fn put_if_absent(&self, key: &CompositeKey, id: Identifier) -> Result<PutOutcome, StoreError> {
        if let Some(delay) = self.put_delay {
            std::thread::sleep(delay);
        }
        let outcome = self.inner.put_if_absent(key, id)?;
        if outcome == PutOutcome::Inserted {
            self.puts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    fn delete_if(&self, key: &CompositeKey, expected: Identifier) -> Result<bool, StoreError> {
        let removed = self.inner.delete_if(key, expected)?;
        if removed {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    fn keys_for(&self, id: &Identifier) -> Result<BTreeSet<CompositeKey>, StoreError> {
        self.inner.keys_for(id)
    }

    fn len(&self) -> Result<usize, StoreError> {
        self.inner.len()
    }
}

/// Store whose writes always fail; reads see an empty store.
#[derive(Debug, Default)]
pub struct FailingKeyStore;

impl KeyStore for FailingKeyStore {
    fn get(&self, _key: &CompositeKey) -> Result<Option<Identifier>, StoreError> {
        Ok(None)
    }

    fn put_if_absent(&self, _key: &CompositeKey, _id: Identifier) -> Result<PutOutcome, StoreError> {
        Err(StoreError::Backend("write rejected".to_string()))
    }

    fn delete_if(&self, _key: &CompositeKey, _expected: Identifier) -> Result<bool, StoreError> {
        Err(StoreError::Backend("write rejected".to_string()))
    }

    fn keys_for(&self, _id: &Identifier) -> Result<BTreeSet<CompositeKey>, StoreError> {
        Ok(BTreeSet::new())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// Store whose reads always fail.
#[derive(Debug, Default)]
pub struct UnreadableKeyStore;

impl KeyStore for UnreadableKeyStore {
    fn get(&self, _key: &CompositeKey) -> Result<Option<Identifier>, StoreError> {
        Err(StoreError::Backend("read rejected".to_string()))
    }

    fn put_if_absent(&self, _key: &CompositeKey, id: Identifier) -> Result<PutOutcome, StoreError> {
        Ok(PutOutcome::Existing(id))
    }

    fn delete_if(&self, _key: &CompositeKey, _expected: Identifier) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn keys_for(&self, _id: &Identifier) -> Result<BTreeSet<CompositeKey>, StoreError> {
        Err(StoreError::Backend("read rejected".to_string()))
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedBatch {
    pub records: Vec<OccurrenceRecord>,
    /// Records whose catalog number repeats an earlier record's
    pub duplicates: usize,
    /// Records with no catalog number at all
    pub empty: usize,
}

/// Seeded occurrence records carrying both triplet terms and an occurrenceID.
pub fn generate_records(
    count: usize,
    duplicate_probability: f64,
    empty_probability: f64,
    seed: u64,
) -> GeneratedBatch {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut records = Vec::with_capacity(count);
    let mut catalog_numbers: Vec<String> = Vec::new();
    let mut duplicates = 0;
    let mut empty = 0;

    let institutions = ["NHM", "AM", "CSIRO", "MV", "QM"];
    for i in 0..count {
        let institution = institutions[rng.random_range(0..institutions.len())];
        let mut record = OccurrenceRecord::new(format!("rec-{i:06}"))
            .with_term(dwc::INSTITUTION_CODE, institution)
            .with_term(dwc::COLLECTION_CODE, "Birds")
            .with_term(dwc::OCCURRENCE_ID, format!("urn:occ:{i:06}"));

        if rng.random_bool(empty_probability) {
            empty += 1;
            record = record.with_term(dwc::CATALOG_NUMBER, "");
        } else if !catalog_numbers.is_empty() && rng.random_bool(duplicate_probability) {
            duplicates += 1;
            let reused = catalog_numbers[rng.random_range(0..catalog_numbers.len())].clone();
            record = record.with_term(dwc::CATALOG_NUMBER, reused);
        } else {
            let catalog = format!("C-{i:06}");
            catalog_numbers.push(catalog.clone());
            record = record.with_term(dwc::CATALOG_NUMBER, catalog);
        }
        records.push(record);
    }

    GeneratedBatch {
        records,
        duplicates,
        empty,
    }
}
