#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use kcvgraph::primitives::bytes::StaticBuffer;
use kcvgraph::storage::backend::{EmbeddedOptions, EmbeddedStoreManager, InMemoryStoreManager};
use kcvgraph::storage::kcv::{
    Entry, KcvMutation, KeyColumnValueStore, KeyRange, KeySelector, SliceQuery, StoreManager,
    StoreMutations,
};
use kcvgraph::{KcvError, Result};
use proptest::prelude::*;
use tempfile::tempdir;

fn buf(bytes: &[u8]) -> StaticBuffer {
    StaticBuffer::copy_from_slice(bytes)
}

fn entry(column: &[u8], value: &[u8]) -> Entry {
    Entry::new(buf(column), buf(value))
}

fn columns(entries: &[Entry]) -> Vec<Vec<u8>> {
    entries.iter().map(|e| e.column.as_slice().to_vec()).collect()
}

fn slices_are_ordered_and_bounded(manager: &dyn StoreManager) -> Result<()> {
    let store = manager.open_store("slices")?;
    let key = buf(b"row");
    store.mutate(
        &key,
        &[entry(b"c", b"3"), entry(b"a", b"1"), entry(b"b", b"2"), entry(b"d", b"4")],
        &[],
    )?;
    let all = store.get_slice(&key, &SliceQuery::full_row())?;
    assert_eq!(columns(&all), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

    let middle = SliceQuery::new(buf(b"b"), buf(b"d"))?;
    assert_eq!(columns(&store.get_slice(&key, &middle)?), vec![b"b".to_vec(), b"c".to_vec()]);

    let capped = SliceQuery::full_row().with_limit(2)?;
    assert_eq!(columns(&store.get_slice(&key, &capped)?), vec![b"a".to_vec(), b"b".to_vec()]);

    let missing = store.get_slice(&buf(b"absent"), &SliceQuery::full_row())?;
    assert!(missing.is_empty());

    let multi = store.get_slices(&[key.clone(), buf(b"absent")], &middle)?;
    assert_eq!(multi.len(), 2);
    assert_eq!(multi[0].1.len(), 2);
    assert!(multi[1].1.is_empty());
    Ok(())
}

fn deletions_apply_before_additions(manager: &dyn StoreManager) -> Result<()> {
    let store = manager.open_store("mutations")?;
    let key = buf(b"row");
    store.mutate(&key, &[entry(b"x", b"old"), entry(b"y", b"keep")], &[])?;
    store.mutate(&key, &[entry(b"x", b"new")], &[buf(b"x"), buf(b"y")])?;
    let row = store.get_slice(&key, &SliceQuery::full_row())?;
    assert_eq!(row, vec![entry(b"x", b"new")]);

    store.mutate(&key, &[], &[buf(b"x")])?;
    assert!(store.get_slice(&key, &SliceQuery::full_row())?.is_empty());
    Ok(())
}

fn key_scans_respect_range_slice_and_selector(manager: &dyn StoreManager) -> Result<()> {
    let store = manager.open_store("scans")?;
    for i in 0u64..20 {
        let column: &[u8] = if i % 5 == 0 { b"z" } else { b"a" };
        store.mutate(&StaticBuffer::from_u64(i), &[entry(column, b"")], &[])?;
    }
    let range = KeyRange::new(StaticBuffer::from_u64(2), StaticBuffer::from_u64(18))?;
    let only_a = SliceQuery::new(buf(b"a"), buf(b"b"))?;
    let keys: Vec<u64> = store
        .get_keys(&range, &only_a, KeySelector::of(100)?)?
        .map(|row| row.and_then(|r| r.key.as_u64()))
        .collect::<Result<_>>()?;
    let expected: Vec<u64> = (2..18).filter(|i| i % 5 != 0).collect();
    assert_eq!(keys, expected);

    let odd = KeySelector::new(
        Arc::new(|k: &StaticBuffer| k.as_u64().is_ok_and(|v| v % 2 == 1)),
        3,
    )?;
    let keys: Vec<u64> = store
        .get_keys(&KeyRange::full(), &SliceQuery::full_row(), odd)?
        .map(|row| row.and_then(|r| r.key.as_u64()))
        .collect::<Result<_>>()?;
    assert_eq!(keys, vec![1, 3, 5]);
    Ok(())
}

fn compare_and_swap_is_conditional(manager: &dyn StoreManager) -> Result<()> {
    assert!(manager.features().conditional_writes);
    let store = manager.open_store("cas")?;
    let (key, column) = (buf(b"k"), buf(&[0x00]));
    assert!(store.compare_and_swap(&key, &column, None, &StaticBuffer::from_u64(10))?);
    assert!(!store.compare_and_swap(&key, &column, None, &StaticBuffer::from_u64(20))?);
    let stale = StaticBuffer::from_u64(5);
    assert!(!store.compare_and_swap(&key, &column, Some(&stale), &StaticBuffer::from_u64(20))?);
    let current = StaticBuffer::from_u64(10);
    assert!(store.compare_and_swap(&key, &column, Some(&current), &StaticBuffer::from_u64(20))?);
    let row = store.get_slice(&key, &SliceQuery::full_row())?;
    assert_eq!(row[0].value.as_u64()?, 20);
    Ok(())
}

fn mutate_many_spans_stores(manager: &dyn StoreManager) -> Result<()> {
    let mut left = KcvMutation::new();
    left.add(entry(b"c", b"1"));
    let mut right = KcvMutation::new();
    right.add(entry(b"c", b"2"));
    let mut mutations = StoreMutations::new();
    mutations.insert("left".into(), BTreeMap::from([(buf(b"k"), left)]));
    mutations.insert("right".into(), BTreeMap::from([(buf(b"k"), right)]));
    manager.mutate_many(&mutations)?;
    for (name, value) in [("left", b"1"), ("right", b"2")] {
        let row = manager.open_store(name)?.get_slice(&buf(b"k"), &SliceQuery::full_row())?;
        assert_eq!(row, vec![entry(b"c", value)]);
    }
    Ok(())
}

fn run_contract(manager: &dyn StoreManager) -> Result<()> {
    slices_are_ordered_and_bounded(manager)?;
    deletions_apply_before_additions(manager)?;
    key_scans_respect_range_slice_and_selector(manager)?;
    compare_and_swap_is_conditional(manager)?;
    mutate_many_spans_stores(manager)?;

    manager.clear_storage()?;
    let store = manager.open_store("slices")?;
    assert!(store.get_slice(&buf(b"row"), &SliceQuery::full_row())?.is_empty());

    manager.close()?;
    assert!(matches!(manager.open_store("slices"), Err(KcvError::Closed(_))));
    Ok(())
}

#[test]
fn in_memory_backend_honours_contract() -> Result<()> {
    run_contract(&InMemoryStoreManager::new())
}

#[test]
fn embedded_backend_honours_contract() -> Result<()> {
    let dir = tempdir()?;
    let manager = EmbeddedStoreManager::open(&EmbeddedOptions::new(dir.path()))?;
    run_contract(&manager)
}

#[test]
fn store_handles_share_rows() -> Result<()> {
    let manager = InMemoryStoreManager::new();
    let a = manager.open_store("shared")?;
    let b = manager.open_store("shared")?;
    a.mutate(&buf(b"k"), &[entry(b"c", b"v")], &[])?;
    assert_eq!(b.get_slice(&buf(b"k"), &SliceQuery::full_row())?.len(), 1);
    assert_eq!(b.name(), "shared");
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn slice_matches_model(
        cells in prop::collection::btree_map(
            prop::collection::vec(any::<u8>(), 1..4),
            prop::collection::vec(any::<u8>(), 0..4),
            0..24,
        ),
        lo in prop::collection::vec(any::<u8>(), 0..3),
        hi in prop::collection::vec(any::<u8>(), 0..3),
    ) {
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        let manager = InMemoryStoreManager::new();
        let store = manager.open_store("model").unwrap();
        let additions: Vec<Entry> = cells.iter().map(|(c, v)| entry(c, v)).collect();
        store.mutate(&buf(b"row"), &additions, &[]).unwrap();

        let query = SliceQuery::new(buf(&lo), buf(&hi)).unwrap();
        let got = store.get_slice(&buf(b"row"), &query).unwrap();
        let expected: Vec<Entry> = cells
            .iter()
            .filter(|(c, _)| lo.as_slice() <= c.as_slice() && c.as_slice() < hi.as_slice())
            .map(|(c, v)| entry(c, v))
            .collect();
        prop_assert_eq!(got, expected);
    }
}
