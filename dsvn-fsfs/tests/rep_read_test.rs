//! Representation reads: plain bases, delta chains, checksums and caches

mod common;

use std::io::Read;

use common::*;
use dsvn_fsfs::index::ItemType;
use dsvn_fsfs::{ChainResolver, DeltaOp, DeltaWindow, FsConfig, FsError, RepHeader, Sha1Digest};

fn finish(w: &mut RevWriter) {
    w.root_dir(&[]);
    w.changes(&[]);
}

#[test]
fn test_plain_representation() {
    let mut repo = RepoBuilder::physical();
    let mut w = repo.revision();
    let rep = w.plain(b"hello world");
    finish(&mut w);
    repo.commit(w);

    let fs = repo.open_uncached();
    let contents = fs.rep_contents(&rep).unwrap();
    assert_eq!(&contents[..], b"hello world");
    assert_eq!(rep.md5.to_hex(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
}

#[test]
fn test_delta_against_plain_base() {
    let mut repo = RepoBuilder::physical();
    let mut w = repo.revision();
    let base = w.plain(b"ABCDEFGH");
    let target = w.delta(&base, &[copy_then_insert(8, 0, 4, b"XYZ")], b"ABCDXYZ");
    finish(&mut w);
    repo.commit(w);

    let fs = repo.open_uncached();
    assert_eq!(&fs.rep_contents(&target).unwrap()[..], b"ABCDXYZ");
    assert_eq!(&fs.rep_contents(&base).unwrap()[..], b"ABCDEFGH");
}

#[test]
fn test_delta_across_revisions_and_versions() {
    let mut repo = RepoBuilder::logical();
    let mut w = repo.revision();
    let base = w.plain(b"0123456789");
    finish(&mut w);
    repo.commit(w);

    let mut w = repo.revision();
    let v0 = w.delta_with_version(&base, &[copy_then_insert(10, 2, 6, b"++")], b"234567++", 0);
    let v1 = w.delta_with_version(&base, &[copy_then_insert(10, 0, 3, b"--")], b"012--", 1);
    finish(&mut w);
    repo.commit(w);

    let fs = repo.open_uncached();
    assert_eq!(&fs.rep_contents(&v0).unwrap()[..], b"234567++");
    assert_eq!(&fs.rep_contents(&v1).unwrap()[..], b"012--");
}

#[test]
fn test_chain_resolves_to_links_plus_base() {
    let mut repo = RepoBuilder::physical();
    let mut w = repo.revision();
    let mut content = b"v".to_vec();
    let mut rep = w.plain(&content);
    for _ in 0..5 {
        let prev_len = content.len() as u64;
        content.push(b'x');
        rep = w.delta(&rep, &[copy_then_insert(prev_len, 0, prev_len, b"x")], &content);
    }
    finish(&mut w);
    repo.commit(w);

    let fs = repo.open_uncached();
    let chain = ChainResolver::new(fs.context()).resolve(&rep).unwrap();
    assert_eq!(chain.links.len(), 5);
    assert!(chain.base.is_some());
    assert_eq!(&fs.rep_contents(&rep).unwrap()[..], b"vxxxxx");
}

#[test]
fn test_self_delta_ends_chain() {
    let mut repo = RepoBuilder::physical();
    let mut w = repo.revision();
    let base = w.self_delta(b"abc");
    let target = w.delta(&base, &[copy_then_insert(3, 0, 3, b"d")], b"abcd");
    finish(&mut w);
    repo.commit(w);

    let fs = repo.open_uncached();
    let chain = ChainResolver::new(fs.context()).resolve(&target).unwrap();
    assert_eq!(chain.links.len(), 2);
    assert!(chain.base.is_none());
    assert_eq!(&fs.rep_contents(&target).unwrap()[..], b"abcd");
    assert_eq!(&fs.rep_contents(&base).unwrap()[..], b"abc");
}

#[test]
fn test_cyclic_chain_is_too_long() {
    let mut repo = RepoBuilder::physical();
    let mut w = repo.revision();
    let payload = svndiff(1, &[copy_then_insert(4, 0, 4, b"!")]);
    let header = RepHeader::Delta {
        base_rev: w.rev(),
        base_item: w.next_offset(),
        base_size: payload.len() as u64,
    };
    let rep = w.raw_rep(ItemType::FileRep, header, &payload, b"loop!");
    finish(&mut w);
    repo.commit(w);

    let fs = repo.open_with(FsConfig {
        max_chain_length: 16,
        ..uncached_config()
    });
    let err = fs.rep_contents(&rep).unwrap_err();
    assert!(matches!(err, FsError::ChainTooLong { max: 16, .. }), "{}", err);
    assert!(err.is_corruption());
}

#[test]
fn test_multi_window_chain() {
    let mut repo = RepoBuilder::physical();
    let mut w = repo.revision();
    let base = w.plain(b"0123456789");
    let window = |sview_offset, sview_len, new: &[u8]| DeltaWindow {
        sview_offset,
        sview_len,
        tview_len: sview_len + new.len() as u64,
        ops: vec![
            DeltaOp::Source { offset: 0, len: sview_len },
            DeltaOp::New { len: new.len() as u64 },
        ],
        new_data: new.to_vec().into(),
    };
    let middle = w.delta(&base, &[window(0, 5, b"a"), window(5, 5, b"b")], b"01234a56789b");
    let head = w.delta(&middle, &[window(0, 6, b"!"), window(6, 6, b"?")], b"01234a!56789b?");
    finish(&mut w);
    repo.commit(w);

    let fs = repo.open_uncached();
    assert_eq!(&fs.rep_contents(&middle).unwrap()[..], b"01234a56789b");

    let mut reader = fs.read_rep(&head).unwrap();
    assert_eq!(reader.len(), 14);
    assert_eq!(&reader.next_chunk().unwrap().unwrap()[..], b"01234a!");
    assert_eq!(&reader.next_chunk().unwrap().unwrap()[..], b"56789b?");
    assert!(reader.next_chunk().unwrap().is_none());

    // small reads through io::Read
    let mut reader = fs.read_rep(&head).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 3];
    loop {
        let n = reader.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    assert_eq!(out, b"01234a!56789b?");
}

#[test]
fn test_missing_base_window_is_corrupt() {
    let mut repo = RepoBuilder::physical();
    let mut w = repo.revision();
    let base = w.plain(b"abcdef");
    let middle = w.delta(&base, &[copy_then_insert(6, 0, 6, b"")], b"abcdef");
    let head = w.delta(
        &middle,
        &[copy_then_insert(6, 0, 6, b"1"), copy_then_insert(6, 0, 6, b"2")],
        b"abcdef1abcdef2",
    );
    finish(&mut w);
    repo.commit(w);

    let fs = repo.open_uncached();
    let err = fs.rep_contents(&head).unwrap_err();
    assert!(err.is_corruption(), "{}", err);
}

#[test]
fn test_empty_delta_expands_to_nothing() {
    let mut repo = RepoBuilder::physical();
    let mut w = repo.revision();
    let mut rep = w.raw_rep(ItemType::FileRep, RepHeader::SelfDelta, &svndiff(0, &[]), b"");
    finish(&mut w);
    repo.commit(w);

    rep.expanded_size = 0;
    let fs = repo.open_uncached();
    let reader = fs.read_rep(&rep).unwrap();
    assert!(reader.is_empty());
    assert!(reader.read_all().unwrap().is_empty());
}

#[test]
fn test_unknown_expanded_size_is_inferred() {
    let mut repo = RepoBuilder::physical();
    let mut w = repo.revision();
    let mut base = w.plain(b"ABCDEFGH");
    let mut target = w.delta(&base, &[copy_then_insert(8, 0, 4, b"XYZ")], b"ABCDXYZ");
    finish(&mut w);
    repo.commit(w);

    base.expanded_size = 0;
    target.expanded_size = 0;
    let fs = repo.open_uncached();
    let reader = fs.read_rep(&target).unwrap();
    assert_eq!(reader.len(), 7);
    assert_eq!(&reader.read_all().unwrap()[..], b"ABCDXYZ");
    assert_eq!(fs.read_rep(&base).unwrap().len(), 8);
}

#[test]
fn test_oversized_expanded_size_is_corrupt() {
    let mut repo = RepoBuilder::physical();
    let mut w = repo.revision();
    let base = w.plain(b"ABCDEFGH");
    let mut target = w.delta(&base, &[copy_then_insert(8, 0, 4, b"XYZ")], b"ABCDXYZ");
    let mut plain = w.plain(b"short");
    finish(&mut w);
    repo.commit(w);

    target.expanded_size = u64::MAX;
    plain.expanded_size = u64::MAX;
    let fs = repo.open();
    let err = fs.rep_contents(&target).unwrap_err();
    assert!(err.is_corruption(), "{}", err);
    assert!(fs.rep_contents(&plain).unwrap_err().is_corruption());
    assert_eq!(fs.cache_stats()["fulltext"].inserts, 0);
}

#[test]
fn test_corrupted_byte_fails_checksum() {
    let mut repo = RepoBuilder::physical();
    let mut w = repo.revision();
    let rep = w.plain(b"hello world");
    finish(&mut w);
    repo.commit(w);

    let path = repo.rev_path(1);
    let mut data = std::fs::read(&path).unwrap();
    let pos = data.windows(11).position(|win| win == b"hello world").unwrap();
    data[pos] = b'j';
    std::fs::write(&path, data).unwrap();

    let fs = repo.open();
    let err = fs.rep_contents(&rep).unwrap_err();
    assert!(err.is_checksum_mismatch(), "{}", err);
    assert_eq!(fs.cache_stats()["fulltext"].inserts, 0);

    let mut reader = fs.read_rep(&rep).unwrap();
    let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[test]
fn test_sha1_checked_when_enabled() {
    let mut repo = RepoBuilder::physical();
    let mut w = repo.revision();
    let mut rep = w.plain(b"contents");
    finish(&mut w);
    repo.commit(w);

    rep.sha1 = Some(Sha1Digest::of(b"something else"));
    let lenient = repo.open_uncached();
    assert_eq!(&lenient.rep_contents(&rep).unwrap()[..], b"contents");

    let strict = repo.open_with(FsConfig {
        verify_sha1: true,
        ..uncached_config()
    });
    assert!(strict.rep_contents(&rep).unwrap_err().is_checksum_mismatch());
}

#[test]
fn test_cached_reads_match_uncached() {
    let mut repo = RepoBuilder::logical();
    let mut w = repo.revision();
    let base = w.plain(b"The quick brown fox");
    let mid = w.delta(&base, &[copy_then_insert(19, 0, 15, b"cat")], b"The quick brown cat");
    let head = w.delta(&mid, &[copy_then_insert(19, 0, 10, b"red cat")], b"The quick red cat");
    finish(&mut w);
    repo.commit(w);

    let uncached = repo.open_uncached();
    let cached = repo.open();
    for rep in [&base, &mid, &head] {
        let expected = uncached.rep_contents(rep).unwrap();
        assert_eq!(cached.rep_contents(rep).unwrap(), expected);
        assert_eq!(cached.rep_contents(rep).unwrap(), expected);
    }
    assert!(cached.cache_stats()["fulltext"].hits >= 3);
    assert_eq!(uncached.cache_stats()["fulltext"].hits, 0);
}

#[test]
fn test_combined_window_short_circuits_chain() {
    let mut repo = RepoBuilder::physical();
    let mut w = repo.revision();
    let base = w.plain(b"abcdefgh");
    let mid = w.delta(&base, &[copy_then_insert(8, 0, 8, b"ij")], b"abcdefghij");
    let head = w.delta(&mid, &[copy_then_insert(10, 0, 10, b"k")], b"abcdefghijk");
    finish(&mut w);
    repo.commit(w);

    let mut config = FsConfig::default();
    config.cache.max_fulltext_size = 0;
    let fs = repo.open_with(config);
    assert_eq!(&fs.rep_contents(&mid).unwrap()[..], b"abcdefghij");
    assert_eq!(fs.cache_stats()["fulltext"].inserts, 0);

    let chain = ChainResolver::new(fs.context()).resolve(&head).unwrap();
    assert_eq!(chain.links.len(), 1);
    assert!(fs.cache_stats()["combined"].hits >= 1);
    assert_eq!(&fs.rep_contents(&head).unwrap()[..], b"abcdefghijk");
}

#[test]
fn test_combined_cache_holds_only_the_head() {
    let mut repo = RepoBuilder::physical();
    let mut w = repo.revision();
    let base = w.plain(b"abcdefgh");
    let mid = w.delta(&base, &[copy_then_insert(8, 0, 8, b"ij")], b"abcdefghij");
    let head = w.delta(&mid, &[copy_then_insert(10, 0, 10, b"k")], b"abcdefghijk");
    finish(&mut w);
    repo.commit(w);

    let mut config = FsConfig::default();
    config.cache.max_fulltext_size = 0;
    let fs = repo.open_with(config);
    assert_eq!(&fs.rep_contents(&head).unwrap()[..], b"abcdefghijk");
    assert_eq!(fs.cache_stats()["combined"].inserts, 1);

    ChainResolver::new(fs.context()).resolve(&mid).unwrap();
    assert_eq!(fs.cache_stats()["combined"].hits, 0);
    ChainResolver::new(fs.context()).resolve(&head).unwrap();
    assert_eq!(fs.cache_stats()["combined"].hits, 1);
}

#[test]
fn test_partial_read_leaves_fulltext_uncached() {
    let mut repo = RepoBuilder::physical();
    let mut w = repo.revision();
    let base = w.plain(b"0123456789");
    let head = w.delta(
        &base,
        &[copy_then_insert(10, 0, 5, b"a"), copy_then_insert(10, 5, 5, b"b")],
        b"01234a56789b",
    );
    finish(&mut w);
    repo.commit(w);

    let fs = repo.open();
    let mut reader = fs.read_rep(&head).unwrap();
    assert_eq!(&reader.next_chunk().unwrap().unwrap()[..], b"01234a");
    drop(reader);
    assert_eq!(fs.cache_stats()["fulltext"].inserts, 0);

    assert_eq!(&fs.rep_contents(&head).unwrap()[..], b"01234a56789b");
    assert_eq!(fs.cache_stats()["fulltext"].inserts, 1);
    assert_eq!(&fs.rep_contents(&head).unwrap()[..], b"01234a56789b");
    assert_eq!(fs.cache_stats()["fulltext"].hits, 1);
}

#[test]
fn test_delta_stream_exposes_stored_windows() {
    let mut repo = RepoBuilder::physical();
    let mut w = repo.revision();
    let base = w.plain(b"ABCDEFGH");
    let other = w.plain(b"unrelated");
    let window = copy_then_insert(8, 0, 4, b"XYZ");
    let target = w.delta(&base, &[window.clone()], b"ABCDXYZ");
    let standalone = w.self_delta(b"standalone");
    finish(&mut w);
    repo.commit(w);

    let fs = repo.open_uncached();
    let mut stream = fs.delta_stream(Some(&base), &target).unwrap().unwrap();
    assert_eq!(stream.version(), 1);
    assert_eq!(stream.md5(), target.md5);
    assert_eq!(stream.expanded_size(), 7);
    assert_eq!(stream.next_window().unwrap(), Some(window));
    assert_eq!(stream.next_window().unwrap(), None);

    assert!(fs.delta_stream(Some(&other), &target).unwrap().is_none());
    assert!(fs.delta_stream(None, &target).unwrap().is_none());
    assert!(fs.delta_stream(None, &standalone).unwrap().is_some());
    assert!(fs.delta_stream(None, &base).unwrap().is_none());
}
