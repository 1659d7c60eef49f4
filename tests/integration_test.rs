use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use proptest::prelude::*;
use tempfile::TempDir;
use treedelta::apply::{self, Output as Bowl};
use treedelta::cancel::CancelToken;
use treedelta::container::WalkOptions;
use treedelta::create;
use treedelta::signature::Signature;
use treedelta::wire::{CodecRegistry, CompressionSettings};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

fn treedelta_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_treedelta"))
}

fn run(args: &[&str]) -> Output {
    let output = Command::new(treedelta_exe())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap();
    if !output.status.success() {
        eprintln!("stdout: {}", String::from_utf8_lossy(&output.stdout));
        eprintln!("stderr: {}", String::from_utf8_lossy(&output.stderr));
    }
    output
}

fn run_ok(args: &[&str]) -> String {
    let output = run(args);
    assert!(output.status.success(), "treedelta {args:?} failed");
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn s(path: &Path) -> &str {
    path.to_str().unwrap()
}

fn create_dir_tree(root: &Path, files: &[(&str, &[u8])]) {
    fs::create_dir_all(root).unwrap();
    for (rel_path, content) in files {
        let full = root.join(rel_path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
    }
}

fn collect_dir_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut entries = Vec::new();
    collect_recursive(root, root, &mut entries);
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

fn collect_recursive(root: &Path, current: &Path, entries: &mut Vec<(String, Vec<u8>)>) {
    let mut dir_entries: Vec<_> = fs::read_dir(current).unwrap().collect::<Result<_, _>>().unwrap();
    dir_entries.sort_by_key(|e| e.file_name());

    for entry in dir_entries {
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap().to_str().unwrap().replace('\\', "/");

        if path.is_dir() {
            collect_recursive(root, &path, entries);
        } else {
            let content = fs::read(&path).unwrap();
            entries.push((rel, content));
        }
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).unwrap();
    for entry in fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir_recursive(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), &target).unwrap();
        }
    }
}

fn write_archive(path: &Path, root: &Path) {
    let mut zw = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in collect_dir_tree(root) {
        zw.start_file(name, SimpleFileOptions::default()).unwrap();
        zw.write_all(&data).unwrap();
    }
    fs::write(path, zw.finish().unwrap().into_inner()).unwrap();
}

fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut x = seed | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x as u8
        })
        .collect()
}

/// Old and new trees with edits, additions, deletions, a rename and a
/// directory that turns into a file.
fn versions(root: &Path) -> (PathBuf, PathBuf) {
    let old_dir = root.join("old");
    let new_dir = root.join("new");
    let records = noise(300 * 1024, 17);
    let mut modified = records.clone();
    modified[70_000] ^= 0xFF;
    modified.splice(200_000..200_000, b"spliced in".iter().copied());
    let asset = noise(90 * 1024, 23);

    create_dir_tree(
        &old_dir,
        &[
            ("readme.txt", &b"Hello, World! This is version 1."[..]),
            ("config/settings.json", &b"{\"version\": 1, \"debug\": false}"[..]),
            ("data/records.bin", records.as_slice()),
            ("data/old_file.txt", &b"This file will be deleted"[..]),
            ("obsolete/remove_me.txt", &b"Going away"[..]),
            ("assets/logo.png", asset.as_slice()),
            ("plugins/core/lib.so", &b"plugin"[..]),
        ],
    );
    create_dir_tree(
        &new_dir,
        &[
            ("readme.txt", &b"Hello, World! This is version 2 with new features."[..]),
            ("config/settings.json", &b"{\"version\": 2, \"debug\": true, \"newField\": 42}"[..]),
            ("data/records.bin", modified.as_slice()),
            ("data/new_file.txt", &b"Brand new file in version 2"[..]),
            ("media/logo.png", asset.as_slice()),
            ("plugins", &b"now a file"[..]),
        ],
    );
    (old_dir, new_dir)
}

#[test]
fn test_end_to_end_full_patch_cycle() {
    let temp = TempDir::new().unwrap();
    let (old_dir, new_dir) = versions(temp.path());
    let target_dir = temp.path().join("target");
    let patch_file = temp.path().join("test.patch");
    copy_dir_recursive(&old_dir, &target_dir);

    let out = run_ok(&["diff", "--target", s(&old_dir), "--source", s(&new_dir), "-o", s(&patch_file)]);
    assert!(out.contains("Patch created successfully!"));
    let out = run_ok(&["apply", "--patch", s(&patch_file), "--target", s(&target_dir)]);
    assert!(out.contains("Files transposed: 1"));

    assert_eq!(collect_dir_tree(&target_dir), collect_dir_tree(&new_dir));
    assert!(!target_dir.join("obsolete").exists());
    assert!(target_dir.join("plugins").is_file());
    assert!(!target_dir.join(".treedelta-stage").exists());
}

#[test]
fn test_every_bowl_builds_the_same_tree() {
    let temp = TempDir::new().unwrap();
    let (old_dir, new_dir) = versions(temp.path());
    let patch_file = temp.path().join("test.patch");
    run_ok(&["diff", "--target", s(&old_dir), "--source", s(&new_dir), "-o", s(&patch_file)]);

    let registry = CodecRegistry::default();
    let cancel = CancelToken::new();
    let expected = collect_dir_tree(&new_dir);

    let dry = apply::apply_patch(&patch_file, &old_dir, Bowl::Dry, &registry, &cancel).unwrap();
    assert_eq!(collect_dir_tree(&old_dir).len(), 7);

    let fresh_dir = temp.path().join("fresh");
    let fresh = apply::apply_patch(&patch_file, &old_dir, Bowl::Fresh(&fresh_dir), &registry, &cancel).unwrap();
    assert_eq!(collect_dir_tree(&fresh_dir), expected);

    let overlay_dir = temp.path().join("overlay");
    copy_dir_recursive(&old_dir, &overlay_dir);
    let overlay = apply::apply_patch(&patch_file, &overlay_dir, Bowl::Overlay, &registry, &cancel).unwrap();
    assert_eq!(collect_dir_tree(&overlay_dir), expected);

    assert_eq!(dry, fresh);
    assert_eq!(fresh, overlay);
}

const SLOTS: [&str; 5] = ["a.bin", "b/c.bin", "b/d.txt", "e/f/g.dat", "h"];

/// Where a source file comes from: edits of a target slot, or fresh noise.
#[derive(Debug, Clone)]
struct SourceFile {
    from: usize,
    seed: u32,
    len: usize,
    edits: Vec<(usize, u8)>,
}

fn source_contents(spec: &SourceFile, target: &[Option<Vec<u8>>]) -> Vec<u8> {
    let mut data = target[spec.from]
        .clone()
        .unwrap_or_else(|| noise(spec.len, spec.seed));
    for &(pos, byte) in &spec.edits {
        let pos = pos % (data.len() + 1);
        data.insert(pos, byte);
    }
    data
}

fn write_slots(root: &Path, slots: &[Option<Vec<u8>>]) {
    fs::create_dir_all(root).unwrap();
    let files: Vec<(&str, &[u8])> = SLOTS
        .iter()
        .zip(slots)
        .filter_map(|(path, data)| data.as_deref().map(|d| (*path, d)))
        .collect();
    create_dir_tree(root, &files);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn random_trees_patch_identically_through_every_bowl(
        target in prop::collection::vec(
            prop::option::of((any::<u32>(), 0usize..150_000).prop_map(|(seed, len)| noise(len, seed))),
            SLOTS.len(),
        ),
        source in prop::collection::vec(
            prop::option::of((0..SLOTS.len(), any::<u32>(), 0usize..150_000, prop::collection::vec((any::<usize>(), any::<u8>()), 0..3))
                .prop_map(|(from, seed, len, edits)| SourceFile { from, seed, len, edits })),
            SLOTS.len(),
        ),
    ) {
        let temp = TempDir::new().unwrap();
        let old_dir = temp.path().join("old");
        let new_dir = temp.path().join("new");
        let patch_file = temp.path().join("random.patch");
        write_slots(&old_dir, &target);
        let source: Vec<Option<Vec<u8>>> = source
            .iter()
            .map(|s| s.as_ref().map(|s| source_contents(s, &target)))
            .collect();
        write_slots(&new_dir, &source);

        let registry = CodecRegistry::default();
        let cancel = CancelToken::new();
        let walk = WalkOptions::default();
        let signature = Signature::compute_dir(&old_dir, &walk, &cancel).unwrap();
        create::create_patch(
            &signature,
            &new_dir,
            &walk,
            &patch_file,
            None,
            CompressionSettings::default(),
            &registry,
            &cancel,
        )
        .unwrap();

        let before = collect_dir_tree(&old_dir);
        let expected = collect_dir_tree(&new_dir);

        let dry = apply::apply_patch(&patch_file, &old_dir, Bowl::Dry, &registry, &cancel).unwrap();
        prop_assert_eq!(collect_dir_tree(&old_dir), before);

        let fresh_dir = temp.path().join("fresh");
        let fresh = apply::apply_patch(&patch_file, &old_dir, Bowl::Fresh(&fresh_dir), &registry, &cancel).unwrap();
        prop_assert_eq!(collect_dir_tree(&fresh_dir), expected.clone());

        let overlay_dir = temp.path().join("overlay");
        copy_dir_recursive(&old_dir, &overlay_dir);
        let overlay = apply::apply_patch(&patch_file, &overlay_dir, Bowl::Overlay, &registry, &cancel).unwrap();
        prop_assert_eq!(collect_dir_tree(&overlay_dir), expected);

        prop_assert_eq!(&dry, &fresh);
        prop_assert_eq!(&fresh, &overlay);
    }
}

#[test]
fn test_empty_to_full() {
    let temp = TempDir::new().unwrap();
    let old_dir = temp.path().join("old");
    let new_dir = temp.path().join("new");
    let patch_file = temp.path().join("test.patch");
    fs::create_dir_all(&old_dir).unwrap();
    create_dir_tree(
        &new_dir,
        &[
            ("file1.txt", &b"First file"[..]),
            ("sub/file2.txt", &b"Second file"[..]),
            ("sub/deep/file3.txt", &b"Third file"[..]),
            ("empty.txt", &b""[..]),
        ],
    );

    run_ok(&["diff", "--target", s(&old_dir), "--source", s(&new_dir), "-o", s(&patch_file)]);
    run_ok(&["apply", "--patch", s(&patch_file), "--target", s(&old_dir)]);
    assert_eq!(collect_dir_tree(&old_dir), collect_dir_tree(&new_dir));
}

#[test]
fn test_no_changes() {
    let temp = TempDir::new().unwrap();
    let old_dir = temp.path().join("old");
    let new_dir = temp.path().join("new");
    let patch_file = temp.path().join("test.patch");
    let files: [(&str, &[u8]); 2] = [("a.txt", b"Same content"), ("b/c.txt", b"Also same")];
    create_dir_tree(&old_dir, &files);
    create_dir_tree(&new_dir, &files);

    run_ok(&["diff", "--target", s(&old_dir), "--source", s(&new_dir), "-o", s(&patch_file)]);
    let out = run_ok(&["apply", "--patch", s(&patch_file), "--target", s(&old_dir)]);
    assert!(out.contains("Files transposed: 2"));
    assert!(out.contains("Bytes written: 0"));
    assert_eq!(collect_dir_tree(&old_dir), collect_dir_tree(&new_dir));
}

#[test]
fn test_dry_run_leaves_target_alone() {
    let temp = TempDir::new().unwrap();
    let (old_dir, new_dir) = versions(temp.path());
    let patch_file = temp.path().join("test.patch");
    let before = collect_dir_tree(&old_dir);

    run_ok(&["diff", "--target", s(&old_dir), "--source", s(&new_dir), "-o", s(&patch_file)]);
    run_ok(&["apply", "--dry", "--patch", s(&patch_file), "--target", s(&old_dir)]);
    assert_eq!(collect_dir_tree(&old_dir), before);
}

#[test]
fn test_diff_against_signature_file() {
    let temp = TempDir::new().unwrap();
    let (old_dir, new_dir) = versions(temp.path());
    let sig_file = temp.path().join("old.sig");
    let patch_file = temp.path().join("test.patch");
    let new_sig = temp.path().join("new.sig");

    let out = run_ok(&["sign", s(&old_dir), "-o", s(&sig_file)]);
    assert!(out.contains("Files: 7"));
    run_ok(&[
        "diff",
        "--target",
        s(&sig_file),
        "--source",
        s(&new_dir),
        "-o",
        s(&patch_file),
        "--signature-out",
        s(&new_sig),
        "--compression",
        "zstd-3",
    ]);

    let fresh_dir = temp.path().join("fresh");
    run_ok(&[
        "apply",
        "--patch",
        s(&patch_file),
        "--target",
        s(&old_dir),
        "--fresh",
        s(&fresh_dir),
    ]);
    assert_eq!(collect_dir_tree(&fresh_dir), collect_dir_tree(&new_dir));

    // The signature written alongside the patch describes the new tree.
    run_ok(&["verify", "--signature", s(&new_sig), "--dir", s(&fresh_dir)]);
}

#[test]
fn test_rediff_keeps_the_result() {
    let temp = TempDir::new().unwrap();
    let (old_dir, new_dir) = versions(temp.path());
    let patch_file = temp.path().join("test.patch");
    let optimized = temp.path().join("test.rediff.patch");

    run_ok(&["diff", "--target", s(&old_dir), "--source", s(&new_dir), "-o", s(&patch_file)]);
    let out = run_ok(&[
        "rediff",
        "--patch",
        s(&patch_file),
        "--target",
        s(&old_dir),
        "--source",
        s(&new_dir),
        "-o",
        s(&optimized),
    ]);
    assert!(out.contains("Files bsdiffed: 1"));
    assert!(fs::metadata(&optimized).unwrap().len() < fs::metadata(&patch_file).unwrap().len());

    let target_dir = temp.path().join("target");
    copy_dir_recursive(&old_dir, &target_dir);
    let out = run_ok(&["apply", "--patch", s(&optimized), "--target", s(&target_dir)]);
    assert!(out.contains("Files bsdiffed: 1"));
    assert_eq!(collect_dir_tree(&target_dir), collect_dir_tree(&new_dir));
}

#[test]
fn test_verify_then_heal() {
    let temp = TempDir::new().unwrap();
    let (_, new_dir) = versions(temp.path());
    let sig_file = temp.path().join("new.sig");
    let archive = temp.path().join("new.zip");
    run_ok(&["sign", s(&new_dir), "-o", s(&sig_file)]);
    write_archive(&archive, &new_dir);

    let installed = temp.path().join("installed");
    copy_dir_recursive(&new_dir, &installed);
    run_ok(&["verify", "--signature", s(&sig_file), "--dir", s(&installed)]);

    let mut records = fs::read(installed.join("data/records.bin")).unwrap();
    records[123_456] ^= 1;
    fs::write(installed.join("data/records.bin"), records).unwrap();
    fs::remove_file(installed.join("readme.txt")).unwrap();

    let failed = run(&["verify", "--signature", s(&sig_file), "--dir", s(&installed)]);
    assert!(!failed.status.success());
    let stdout = String::from_utf8_lossy(&failed.stdout);
    assert!(stdout.contains("wounded: data/records.bin [65536, 131072)"));
    assert!(stdout.contains("wounded: readme.txt"));

    let from = format!("archive,{}", archive.display());
    let out = run_ok(&[
        "heal",
        "--signature",
        s(&sig_file),
        "--dir",
        s(&installed),
        "--from",
        &from,
        "--workers",
        "2",
    ]);
    assert!(out.contains("Files healed: 2"));
    run_ok(&["verify", "--signature", s(&sig_file), "--dir", s(&installed)]);
    assert_eq!(collect_dir_tree(&installed), collect_dir_tree(&new_dir));
}

#[test]
fn test_corrupt_patch_is_rejected() {
    let temp = TempDir::new().unwrap();
    let (old_dir, _) = versions(temp.path());
    let patch_file = temp.path().join("bogus.patch");
    fs::write(&patch_file, b"definitely not a patch").unwrap();
    let before = collect_dir_tree(&old_dir);

    let output = run(&["apply", "--patch", s(&patch_file), "--target", s(&old_dir)]);
    assert!(!output.status.success());
    assert_eq!(collect_dir_tree(&old_dir), before);
}

#[cfg(unix)]
#[test]
fn test_modes_and_symlinks_survive() {
    use std::os::unix::fs::{symlink, PermissionsExt};

    let temp = TempDir::new().unwrap();
    let old_dir = temp.path().join("old");
    let new_dir = temp.path().join("new");
    let patch_file = temp.path().join("test.patch");
    create_dir_tree(&old_dir, &[("bin/run.sh", &b"#!/bin/sh\necho old\n"[..]), ("lib/a.so", &b"a"[..])]);
    symlink("a.so", old_dir.join("lib/current")).unwrap();
    create_dir_tree(&new_dir, &[("bin/run.sh", &b"#!/bin/sh\necho new\n"[..]), ("lib/b.so", &b"b"[..])]);
    fs::set_permissions(new_dir.join("bin/run.sh"), fs::Permissions::from_mode(0o755)).unwrap();
    symlink("b.so", new_dir.join("lib/current")).unwrap();

    run_ok(&["diff", "--target", s(&old_dir), "--source", s(&new_dir), "-o", s(&patch_file)]);

    let fresh_dir = temp.path().join("fresh");
    run_ok(&["apply", "--patch", s(&patch_file), "--target", s(&old_dir), "--fresh", s(&fresh_dir)]);
    run_ok(&["apply", "--patch", s(&patch_file), "--target", s(&old_dir)]);

    for dir in [&fresh_dir, &old_dir] {
        let mode = fs::metadata(dir.join("bin/run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(fs::read_link(dir.join("lib/current")).unwrap(), Path::new("b.so"));
        assert_eq!(fs::read(dir.join("lib/current")).unwrap(), b"b");
        assert!(!dir.join("lib/a.so").exists());
    }
}
