//! Drives the ODFE renderer adapter through a fake engine executable.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use demoflow::renderer::{
    DemoRenderer,
    OdfeDemoRenderer,
};

fn write_executable(path: &Path, contents: &str) {
    fs::write(path, contents).expect("write script");
    let mut permissions = fs::metadata(path).expect("script metadata").permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(path, permissions).expect("make script executable");
}

struct RenderDirs {
    _root: tempfile::TempDir,
    odfe_dir: std::path::PathBuf,
    config_dir: std::path::PathBuf,
    demo_dir: std::path::PathBuf,
    video_dir: std::path::PathBuf,
    executable: std::path::PathBuf,
}

fn setup(script_body: &str) -> RenderDirs {
    let root = tempfile::tempdir().expect("tempdir");
    let odfe_dir = root.path().join("odfe");
    let config_dir = root.path().join("config");
    let demo_dir = root.path().join("demo");
    let video_dir = root.path().join("video");
    let executable_dir = root.path().join("executable");
    for dir in [&odfe_dir, &config_dir, &demo_dir, &video_dir, &executable_dir] {
        fs::create_dir(dir).expect("create dir");
    }
    let executable = executable_dir.join("fake-odfe.sh");
    write_executable(
        &executable,
        &script_body.replace("VIDEO_DIR", &video_dir.to_string_lossy()),
    );
    RenderDirs {
        _root: root,
        odfe_dir,
        config_dir,
        demo_dir,
        video_dir,
        executable,
    }
}

#[test]
fn renders_a_demo_and_cleans_up_its_scratch_files() {
    let dirs = setup(
        "#!/bin/sh\n\
         # $1 is +exec, $2 is the per-render config file name.\n\
         id=\"${2%.cfg}\"\n\
         echo fake-video > \"VIDEO_DIR/${id}.mp4\"\n",
    );
    let renderer = OdfeDemoRenderer::new(
        &dirs.odfe_dir,
        &dirs.executable,
        &dirs.config_dir,
        &dirs.demo_dir,
        &dirs.video_dir,
        "// prefix",
    );

    let video = renderer.render("sdf.dm_62", b"demo-bytes").expect("render");
    assert!(video.exists());
    assert_eq!(video.extension().and_then(|e| e.to_str()), Some("mp4"));

    fs::remove_file(&video).expect("remove video");
    for dir in [&dirs.config_dir, &dirs.demo_dir, &dirs.video_dir, &dirs.odfe_dir] {
        let entries: Vec<_> = fs::read_dir(dir).expect("read dir").collect();
        assert!(entries.is_empty(), "{} not empty", dir.display());
    }
}

#[test]
fn a_non_zero_engine_exit_is_fatal_and_still_cleans_up() {
    let dirs = setup("#!/bin/sh\necho boom >&2\nexit 7\n");
    let renderer = OdfeDemoRenderer::new(
        &dirs.odfe_dir,
        &dirs.executable,
        &dirs.config_dir,
        &dirs.demo_dir,
        &dirs.video_dir,
        "",
    );

    let err = renderer
        .render("sdf.dm_62", b"demo-bytes")
        .expect_err("render must fail");
    assert!(err.to_string().contains("demo renderer exited"));

    for dir in [&dirs.config_dir, &dirs.demo_dir, &dirs.video_dir] {
        let entries: Vec<_> = fs::read_dir(dir).expect("read dir").collect();
        assert!(entries.is_empty(), "{} not empty", dir.display());
    }
}

#[test]
fn a_missing_output_video_is_fatal() {
    let dirs = setup("#!/bin/sh\nexit 0\n");
    let renderer = OdfeDemoRenderer::new(
        &dirs.odfe_dir,
        &dirs.executable,
        &dirs.config_dir,
        &dirs.demo_dir,
        &dirs.video_dir,
        "",
    );
    let err = renderer
        .render("sdf.dm_62", b"demo-bytes")
        .expect_err("render must fail");
    assert!(err.to_string().contains("without producing"));
}

#[test]
fn the_render_config_carries_the_prefix_and_directives() {
    // The fake engine copies the config it was asked to exec next to the
    // video so the test can inspect what the adapter wrote.
    let dirs = setup(
        "#!/bin/sh\n\
         id=\"${2%.cfg}\"\n\
         cp \"CONFIG_DIR/$2\" \"VIDEO_DIR/config-copy.txt\"\n\
         echo fake-video > \"VIDEO_DIR/${id}.mp4\"\n",
    );
    // Substitute the config dir after the fact; setup only knows VIDEO_DIR.
    let script = fs::read_to_string(&dirs.executable).expect("read script");
    write_executable(
        &dirs.executable,
        &script.replace("CONFIG_DIR", &dirs.config_dir.to_string_lossy()),
    );

    let renderer = OdfeDemoRenderer::new(
        &dirs.odfe_dir,
        &dirs.executable,
        &dirs.config_dir,
        &dirs.demo_dir,
        &dirs.video_dir,
        "// my prefix\nseta mme_saveWav 0",
    );
    let video = renderer.render("run.dm_68", b"demo-bytes").expect("render");

    let config = fs::read_to_string(dirs.video_dir.join("config-copy.txt")).expect("config copy");
    assert!(config.starts_with("// my prefix\nseta mme_saveWav 0\n"));
    assert!(config.contains("demo \""));
    assert!(config.contains("video-pipe \""));
    assert!(config.contains("set nextdemo \"wait 100; quit\""));

    fs::remove_file(video).expect("remove video");
}
