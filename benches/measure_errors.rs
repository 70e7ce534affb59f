//! Error measurement benchmark
//!
//! Times one full reprojection measurement, the inner loop of every solver
//! iteration, for both scene evaluation strategies on a synthetic scene with
//! an animated camera and a lens.
//!
//! ## Usage
//!
//! ```bash
//! cargo bench --bench measure_errors
//! ```

use camsolve::layout::SolveLayout;
use camsolve::lens::{LensAttribute, LensModel, LensModelType};
use camsolve::measure::{ErrorMeasurer, Measurement};
use camsolve::relationships::compute_marker_affects;
use camsolve::scene::{CameraDesc, LensLink, MarkerId, create_evaluator};
use camsolve::topology::LensTopology;
use camsolve::{CamSolveResult, Scene, SceneGraphMode, TimeEvalMode};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use nalgebra::Vector3;
use std::hint::black_box;

const MODE: TimeEvalMode = TimeEvalMode::DgContext;
const NUM_FRAMES: i32 = 48;

fn build_scene(num_bundles: usize) -> CamSolveResult<(Scene, Vec<MarkerId>)> {
    let mut scene = Scene::new();
    let camera = scene.add_camera("camera1", CameraDesc::default())?;
    let mut model = LensModel::identity(LensModelType::Basic);
    model.set_attribute(LensAttribute::BasicK1, 0.02);
    let lens = scene.add_lens_node("lens1", model)?;
    scene.connect_camera_lens(camera, LensLink::Lens(lens))?;

    let tx = scene.attribute("camera1", "translateX")?;
    for frame in 1..=NUM_FRAMES {
        scene.set_key(tx.plug, frame, 0.01 * f64::from(frame))?;
    }

    let mut markers = Vec::with_capacity(num_bundles);
    for i in 0..num_bundles {
        let t = i as f64;
        let position = Vector3::new((t * 0.7).sin() * 2.0, (t * 1.3).cos() * 1.5, -8.0 - t % 5.0);
        let bundle = scene.add_bundle(&format!("bundle{i}"), position)?;
        let marker = scene.add_marker(&format!("marker{i}"), camera, bundle)?;
        for frame in 1..=NUM_FRAMES {
            let offset = 0.001 * f64::from(frame % 7);
            scene.set_marker_position(marker, frame, offset, -offset)?;
        }
        markers.push(marker);
    }
    Ok((scene, markers))
}

struct Fixture {
    scene: Scene,
    layout: SolveLayout,
    topology: LensTopology,
}

fn fixture(num_bundles: usize) -> CamSolveResult<Fixture> {
    let (scene, markers) = build_scene(num_bundles)?;
    let attributes = vec![
        scene.attribute("camera1", "translateX")?,
        scene.attribute("lens1", "k1")?,
    ];
    let frames: Vec<i32> = (1..=NUM_FRAMES).collect();
    let affects = compute_marker_affects(&scene, &markers, &attributes, frames[0], MODE)?;
    let layout = SolveLayout::build(&scene, markers, attributes, frames, &[], &[], affects, MODE)?;
    let topology = LensTopology::build(&scene, &layout.markers, &layout.attributes, &layout.frames, MODE)?;
    Ok(Fixture {
        scene,
        layout,
        topology,
    })
}

fn bench_measure(c: &mut Criterion) {
    let mut group = c.benchmark_group("measure_errors");
    for num_bundles in [16, 128] {
        let fixture = match fixture(num_bundles) {
            Ok(fixture) => fixture,
            Err(err) => {
                eprintln!("Skipping {num_bundles} bundles: {err}");
                continue;
            }
        };
        for mode in [SceneGraphMode::Dag, SceneGraphMode::Flat] {
            let evaluator = match create_evaluator(
                mode,
                &fixture.scene,
                &fixture.layout.markers,
                &fixture.layout.frames,
                MODE,
                false,
            ) {
                Ok(evaluator) => evaluator,
                Err(err) => {
                    eprintln!("Skipping {mode}: {err}");
                    continue;
                }
            };
            let mut measurer = ErrorMeasurer::new(evaluator, 2048.0, MODE, true);
            let mut measurement = Measurement::zeros(&fixture.layout);
            group.bench_with_input(
                BenchmarkId::new(mode.to_string(), num_bundles),
                &num_bundles,
                |b, _| {
                    b.iter(|| {
                        let result = measurer.measure(
                            &fixture.scene,
                            &fixture.topology,
                            &fixture.layout,
                            None,
                            &mut measurement,
                        );
                        black_box(result.is_ok());
                        black_box(measurement.stats.avg)
                    })
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_measure);
criterion_main!(benches);
