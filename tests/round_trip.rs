use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use sshtable::{
    BuildError, Builder, Hashtable, LoadError, LoadPolicy, Readers, RecordReader, SliceReader,
    TableKind,
};

fn readers_over<'a>(batches: &'a [Vec<(Vec<u8>, Vec<u8>)>]) -> Readers<'a> {
    batches
        .iter()
        .map(|b| Box::new(SliceReader::new(b)) as Box<dyn RecordReader + Send + 'a>)
        .collect()
}

fn key8(i: u64) -> Vec<u8> {
    i.to_le_bytes().to_vec()
}

fn build_set(batches: &[Vec<(Vec<u8>, Vec<u8>)>]) -> Vec<u8> {
    let mut readers = readers_over(batches);
    let mut out = Vec::new();
    Builder::new().build_set(&mut readers, &mut out).unwrap();
    out
}

fn build_dict(batches: &[Vec<(Vec<u8>, Vec<u8>)>]) -> Vec<u8> {
    let mut readers = readers_over(batches);
    let mut out = Vec::new();
    Builder::new().build_dict(&mut readers, &mut out).unwrap();
    out
}

fn build_varied(batches: &[Vec<(Vec<u8>, Vec<u8>)>]) -> Vec<u8> {
    let mut readers = readers_over(batches);
    let mut out = Vec::new();
    Builder::new()
        .build_varied_dict(&mut readers, &mut out)
        .unwrap();
    out
}

/// Checks the finished-artifact guide invariants straight off the bytes:
/// no reservation sentinel survives, and the header's entry count equals
/// the number of occupied slots.
fn assert_guide_invariants(artifact: &[u8]) {
    let set_cnt = u64::from_le_bytes(artifact[24..32].try_into().unwrap());
    let item = u64::from_le_bytes(artifact[16..24].try_into().unwrap());
    let guide = &artifact[64..64 + (set_cnt * 64) as usize];
    let mut occupied = 0u64;
    for &b in guide {
        assert!(b == 0xFF || b <= 0x7F, "stray guide byte {b:#x}");
        if b & 0x80 == 0 {
            occupied += 1;
        }
    }
    assert_eq!(occupied, item);
}

#[test]
fn key_set_round_trip() {
    let records: Vec<_> = (0u64..256).map(|i| (key8(i), Vec::new())).collect();
    let artifact = build_set(&[records]);
    assert_guide_invariants(&artifact);

    let table = Hashtable::from_bytes(artifact).unwrap();
    assert_eq!(table.kind(), TableKind::KeySet);
    assert_eq!(table.key_len(), 8);
    assert_eq!(table.val_len(), 0);
    assert_eq!(table.item(), 256);

    for i in 0u64..256 {
        let hit = table.search(&key8(i)).expect("present key must hit");
        assert!(hit.is_empty());
    }
    assert!(table.search(&[0xFF; 8]).is_none());
    // A wrong-length key can never be stored.
    assert!(table.search(&[0u8; 7]).is_none());
}

#[test]
fn inline_duplicates_keep_one_value() {
    let mut records = vec![
        (b"AAAA".to_vec(), b"v1".to_vec()),
        (b"AAAA".to_vec(), b"v2".to_vec()),
    ];
    for i in 0u32..8 {
        records.push((i.to_le_bytes().to_vec(), (i as u16).to_le_bytes().to_vec()));
    }
    let artifact = build_dict(&[records.clone()]);
    assert_guide_invariants(&artifact);

    let table = Hashtable::from_bytes(artifact).unwrap();
    assert_eq!(table.kind(), TableKind::KvInline);
    assert_eq!(table.item(), 9);

    let kept = table.search(b"AAAA").expect("duplicate key still present");
    assert!(kept == &b"v1"[..] || kept == &b"v2"[..]);
    for i in 0u32..8 {
        assert_eq!(
            table.search(&i.to_le_bytes()),
            Some(&(i as u16).to_le_bytes()[..])
        );
    }
}

#[test]
fn separated_values_round_trip_across_varint_boundaries() {
    let lens = [0usize, 1, 127, 128, 16_383, 16_384];
    let records: Vec<_> = lens
        .iter()
        .enumerate()
        .map(|(i, &len)| {
            let val: Vec<u8> = (0..len).map(|j| (i + j) as u8).collect();
            ((i as u32).to_le_bytes().to_vec(), val)
        })
        .collect();
    let artifact = build_varied(&[records.clone()]);
    assert_guide_invariants(&artifact);

    let table = Hashtable::from_bytes(artifact).unwrap();
    assert_eq!(table.kind(), TableKind::KvSeparated);
    assert_eq!(table.val_len(), 6);
    assert_eq!(table.item(), lens.len() as u64);

    for (key, val) in &records {
        assert_eq!(table.search(key), Some(&val[..]));
    }
    assert!(table.search(&99u32.to_le_bytes()).is_none());
}

#[test]
fn varied_build_rejects_duplicate_keys() {
    let records = vec![
        (b"dup0".to_vec(), b"x".to_vec()),
        (b"dup0".to_vec(), b"y".to_vec()),
        (b"keep".to_vec(), b"z".to_vec()),
    ];
    let mut readers = readers_over(std::slice::from_ref(&records));
    let mut out = Vec::new();
    let err = Builder::new()
        .build_varied_dict(&mut readers, &mut out)
        .unwrap_err();
    assert!(matches!(err, BuildError::BadInput));
}

#[test]
fn empty_reader_list_is_bad_input() {
    let mut readers: Readers<'_> = Vec::new();
    let mut out = Vec::new();
    assert!(matches!(
        Builder::new().build_set(&mut readers, &mut out),
        Err(BuildError::BadInput)
    ));
    assert!(matches!(
        Builder::new().build_dict(&mut readers, &mut out),
        Err(BuildError::BadInput)
    ));
    assert!(matches!(
        Builder::new().build_varied_dict(&mut readers, &mut out),
        Err(BuildError::BadInput)
    ));
}

#[test]
fn single_record_build_uses_one_set() {
    let records = vec![(key8(7), Vec::new())];
    let artifact = build_set(&[records]);
    // Header + one 64-slot guide + 64 rows of 8 key bytes.
    assert_eq!(artifact.len(), 64 + 64 + 64 * 8);
    assert_guide_invariants(&artifact);

    let table = Hashtable::from_bytes(artifact).unwrap();
    assert_eq!(table.item(), 1);
    assert!(table.search(&key8(7)).is_some());
    assert!(table.search(&key8(8)).is_none());
}

#[test]
fn parallel_build_counts_shared_keys_once() {
    // Two streams sharing 10_000 keys; the winning value per shared key is
    // scheduling-dependent, the distinct count is not.
    let a: Vec<_> = (0u64..100_000).map(|i| (key8(i), Vec::new())).collect();
    let b: Vec<_> = (90_000u64..190_000).map(|i| (key8(i), Vec::new())).collect();
    let batches = [a, b];
    for _ in 0..3 {
        let artifact = build_set(&batches);
        assert_guide_invariants(&artifact);
        let table = Hashtable::from_bytes(artifact).unwrap();
        assert_eq!(table.item(), 190_000);
    }
}

#[test]
fn batch_search_with_patch_overlay() {
    let base_records = vec![(b"a".to_vec(), vec![1u8]), (b"b".to_vec(), vec![2u8])];
    let patch_records = vec![(b"b".to_vec(), vec![20u8]), (b"c".to_vec(), vec![30u8])];
    let base = Hashtable::from_bytes(build_dict(&[base_records])).unwrap();
    let patch = Hashtable::from_bytes(build_dict(&[patch_records])).unwrap();

    let keys: Vec<&[u8]> = vec![b"a", b"b", b"c", b"d"];
    let mut out = vec![None; 4];
    let hits = base.batch_search(&keys, &mut out, Some(&patch));
    assert_eq!(hits, 3);
    assert_eq!(out[0], Some(&[1u8][..]));
    assert_eq!(out[1], Some(&[20u8][..]));
    assert_eq!(out[2], Some(&[30u8][..]));
    assert_eq!(out[3], None);

    // Without the patch, "b" falls back to the base value and "c" misses.
    let mut out = vec![None; 4];
    let hits = base.batch_search(&keys, &mut out, None);
    assert_eq!(hits, 2);
    assert_eq!(out[1], Some(&[2u8][..]));
    assert_eq!(out[2], None);

    // A self-referential patch is ignored, not an error.
    let mut out = vec![None; 4];
    assert_eq!(base.batch_search(&keys, &mut out, Some(&base)), 2);
}

#[test]
fn batch_fetch_packed_arrays() {
    let base_records = vec![(b"a".to_vec(), vec![1u8]), (b"b".to_vec(), vec![2u8])];
    let patch_records = vec![(b"b".to_vec(), vec![20u8]), (b"c".to_vec(), vec![30u8])];
    let base = Hashtable::from_bytes(build_dict(&[base_records])).unwrap();
    let patch = Hashtable::from_bytes(build_dict(&[patch_records])).unwrap();

    let keys = *b"abcd";
    let mut out = [0x77u8; 4];
    let hits = base.batch_fetch(4, &keys, &mut out, Some(&[0xEE]), Some(&patch));
    assert_eq!(hits, 3);
    assert_eq!(out, [1, 20, 30, 0xEE]);

    // Without a default, missing rows stay untouched.
    let mut out = [0x77u8; 4];
    let hits = base.batch_fetch(4, &keys, &mut out, None, Some(&patch));
    assert_eq!(hits, 3);
    assert_eq!(out, [1, 20, 30, 0x77]);

    // Zero batch: no work, no side effects.
    let mut out = [0x77u8; 4];
    assert_eq!(base.batch_fetch(0, &keys, &mut out, None, None), 0);
    assert_eq!(out, [0x77; 4]);
}

#[test]
fn batch_search_agrees_with_single_search() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut records = Vec::new();
    for i in 0u64..5_000 {
        let mut val = [0u8; 8];
        rng.fill_bytes(&mut val);
        records.push((key8(i), val.to_vec()));
    }
    let table = Hashtable::from_bytes(build_dict(&[records])).unwrap();

    // Present and absent keys interleaved, batch larger than the window.
    let probe: Vec<Vec<u8>> = (0u64..2_000).map(|i| key8(i * 3)).collect();
    let keys: Vec<&[u8]> = probe.iter().map(|k| k.as_slice()).collect();
    let mut out = vec![None; keys.len()];
    let hits = table.batch_search(&keys, &mut out, None);

    let mut expected_hits = 0;
    for (key, got) in keys.iter().zip(&out) {
        let single = table.search(key);
        assert_eq!(single, *got);
        if single.is_some() {
            expected_hits += 1;
        }
    }
    assert_eq!(hits, expected_hits);
}

#[test]
fn batch_rejects_incompatible_patch() {
    let base =
        Hashtable::from_bytes(build_dict(&[vec![(b"aa".to_vec(), vec![1u8])]])).unwrap();
    let other =
        Hashtable::from_bytes(build_dict(&[vec![(b"aa".to_vec(), vec![1u8, 2u8])]])).unwrap();
    let keys: Vec<&[u8]> = vec![b"aa"];
    let mut out = vec![None; 1];
    // val_len mismatch rejects the whole batch.
    assert_eq!(base.batch_search(&keys, &mut out, Some(&other)), 0);
}

#[test]
fn derive_fixed_new_values_win() {
    let base_records: Vec<_> = (0u64..1_000).map(|i| (key8(i), b"old".to_vec())).collect();
    let base = Hashtable::from_bytes(build_dict(&[base_records])).unwrap();

    let new_records: Vec<_> = (800u64..1_300).map(|i| (key8(i), b"new".to_vec())).collect();
    let batches = [new_records];
    let mut readers = readers_over(&batches);
    let mut out = Vec::new();
    base.derive(&mut readers, &mut out).unwrap();
    assert_guide_invariants(&out);

    let derived = Hashtable::from_bytes(out).unwrap();
    assert_eq!(derived.item(), 1_300);
    for i in 0u64..800 {
        assert_eq!(derived.search(&key8(i)), Some(&b"old"[..]));
    }
    for i in 800u64..1_300 {
        assert_eq!(derived.search(&key8(i)), Some(&b"new"[..]));
    }
    assert!(derived.search(&key8(1_300)).is_none());
}

#[test]
fn derive_key_set_unions() {
    let base_records: Vec<_> = (0u64..100).map(|i| (key8(i), Vec::new())).collect();
    let base = Hashtable::from_bytes(build_set(&[base_records])).unwrap();

    let batches = [(50u64..150).map(|i| (key8(i), Vec::new())).collect::<Vec<_>>()];
    let mut readers = readers_over(&batches);
    let mut out = Vec::new();
    base.derive(&mut readers, &mut out).unwrap();

    let derived = Hashtable::from_bytes(out).unwrap();
    assert_eq!(derived.item(), 150);
    for i in 0u64..150 {
        assert!(derived.search(&key8(i)).is_some());
    }
    assert!(derived.search(&key8(150)).is_none());
}

#[test]
fn derive_varied_new_values_win() {
    let base_records: Vec<_> = (0u64..300)
        .map(|i| (key8(i), format!("val{i}").into_bytes()))
        .collect();
    let base = Hashtable::from_bytes(build_varied(&[base_records])).unwrap();

    let new_records: Vec<_> = (200u64..400)
        .map(|i| (key8(i), format!("NEW{i}").into_bytes()))
        .collect();
    let batches = [new_records];
    let mut readers = readers_over(&batches);
    let mut out = Vec::new();
    base.derive(&mut readers, &mut out).unwrap();
    assert_guide_invariants(&out);

    let derived = Hashtable::from_bytes(out).unwrap();
    assert_eq!(derived.item(), 400);
    for i in 0u64..200 {
        assert_eq!(derived.search(&key8(i)), Some(format!("val{i}").as_bytes()));
    }
    for i in 200u64..400 {
        assert_eq!(derived.search(&key8(i)), Some(format!("NEW{i}").as_bytes()));
    }
}

#[test]
fn derive_with_empty_reader_list_is_bad_input() {
    let base = Hashtable::from_bytes(build_set(&[vec![(key8(1), Vec::new())]])).unwrap();
    let mut readers: Readers<'_> = Vec::new();
    let mut out = Vec::new();
    assert!(matches!(
        base.derive(&mut readers, &mut out),
        Err(BuildError::BadInput)
    ));
}

#[test]
fn load_policies_do_not_change_semantics() {
    let records: Vec<_> = (0u64..500).map(|i| (key8(i), vec![i as u8, 0xAB])).collect();
    let artifact = build_dict(&[records]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("table.ssht");
    std::fs::write(&path, &artifact).unwrap();

    for policy in [
        LoadPolicy::MapOnly,
        LoadPolicy::MapFetch,
        LoadPolicy::MapOccupy,
        LoadPolicy::CopyData,
    ] {
        let table = Hashtable::load(&path, policy).unwrap();
        assert_eq!(table.item(), 500);
        for i in (0u64..500).step_by(37) {
            assert_eq!(table.search(&key8(i)), Some(&[i as u8, 0xAB][..]));
        }
        assert!(table.search(&key8(500)).is_none());
    }
}

#[test]
fn loader_rejects_malformed_artifacts() {
    // Too short for a header.
    assert!(matches!(
        Hashtable::from_bytes(vec![0u8; 10]),
        Err(LoadError::Invalid(_))
    ));

    let good = build_set(&[vec![(key8(1), Vec::new())]]);

    let mut bad_magic = good.clone();
    bad_magic[0] ^= 0xFF;
    assert!(Hashtable::from_bytes(bad_magic).is_err());

    let mut bad_kind = good.clone();
    bad_kind[4] = 0x33;
    assert!(Hashtable::from_bytes(bad_kind).is_err());

    // A key set must not carry a value length.
    let mut bad_val = good.clone();
    bad_val[6] = 2;
    assert!(Hashtable::from_bytes(bad_val).is_err());

    let truncated = good[..good.len() - 1].to_vec();
    assert!(Hashtable::from_bytes(truncated).is_err());

    let missing = tempfile::tempdir().unwrap().path().join("nope.ssht");
    assert!(matches!(
        Hashtable::load(&missing, LoadPolicy::MapOnly),
        Err(LoadError::Io(_))
    ));
}

#[test]
fn extreme_value_lengths() {
    // Smallest legal key and value.
    let tiny = Hashtable::from_bytes(build_dict(&[vec![(vec![9u8], vec![3u8])]])).unwrap();
    assert_eq!(tiny.key_len(), 1);
    assert_eq!(tiny.val_len(), 1);
    assert_eq!(tiny.search(&[9]), Some(&[3u8][..]));

    // Largest inline value.
    let big_val = vec![0x5A; 65_535];
    let big =
        Hashtable::from_bytes(build_dict(&[vec![(b"bigk".to_vec(), big_val.clone())]])).unwrap();
    assert_eq!(big.val_len(), 65_535);
    assert_eq!(big.search(b"bigk"), Some(&big_val[..]));
}

#[test]
fn multi_stream_varied_build_keeps_stream_order_offsets() {
    let a: Vec<_> = (0u64..50).map(|i| (key8(i), vec![i as u8; (i % 7) as usize])).collect();
    let b: Vec<_> = (50u64..120)
        .map(|i| (key8(i), vec![!(i as u8); (i % 11) as usize]))
        .collect();
    let batches = [a.clone(), b.clone()];
    let table = Hashtable::from_bytes(build_varied(&batches)).unwrap();
    assert_eq!(table.item(), 120);
    for (key, val) in a.iter().chain(&b) {
        assert_eq!(table.search(key), Some(&val[..]));
    }
}
