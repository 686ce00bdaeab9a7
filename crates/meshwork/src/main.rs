use std::{env, process};

use itertools::{Itertools, MinMaxResult};
use meshwork::{nn::onnx::OnnxGraph, timer::FpsCounter, Detector, Gpu, Image, ResourceSet};

fn main() -> anyhow::Result<()> {
    meshwork::init_logger!();

    let mut args = env::args().skip(1);
    let (Some(model), images) = (args.next(), args.collect::<Vec<_>>()) else {
        eprintln!("usage: meshwork <model.onnx> <image>...");
        process::exit(1);
    };
    if images.is_empty() {
        eprintln!("usage: meshwork <model.onnx> <image>...");
        process::exit(1);
    }

    let gpu = Gpu::try_get()?;
    let graph = OnnxGraph::from_path(&model)?;
    for output in graph.outputs() {
        log::debug!("model output `{}`: {} values", output.name(), output.len());
    }

    let resources = ResourceSet::new(gpu, graph)?;
    let mut detector = Detector::new(&resources)?;

    let mut fps = FpsCounter::new("meshwork");
    for path in &images {
        let image = Image::load(gpu, path)?;
        detector.process_image(&image)?;

        let confidence = detector.face_confidence()?;
        let mesh = detector.vertex_array()?;
        let (x, y, z) = (
            bounds(mesh.iter().map(|v| v[0])),
            bounds(mesh.iter().map(|v| v[1])),
            bounds(mesh.iter().map(|v| v[2])),
        );
        println!(
            "{path}: {}x{}, face confidence {confidence:.3}, mesh X {x}, Y {y}, Z {z}",
            image.width(),
            image.height(),
        );

        fps.tick_with(detector.timers());
    }

    Ok(())
}

fn bounds(values: impl Iterator<Item = f32>) -> String {
    match values.minmax_by(f32::total_cmp) {
        MinMaxResult::NoElements => "-".into(),
        MinMaxResult::OneElement(v) => format!("{v:.3}"),
        MinMaxResult::MinMax(min, max) => format!("{min:.3}..={max:.3}"),
    }
}
