use std::error::Error;

use masked_cnn::{
    config::RuntimeConfig,
    graph::{
        Graph, Layer, Pass,
        layers::{
            Convolution, Deconvolution, Dropout, Eltwise, FullyConnected, Input, Pool, Softmax,
        },
    },
    hal::activation::Activation,
    loom::tensor::Tensor,
    runner::Runner,
    video::{ChangeDetector, change_percent_of_frame},
};

const SHAPE: [usize; 3] = [3, 12, 12];

fn random(rng: &mut fastrand::Rng, shape: impl masked_cnn::loom::shape::IntoShape) -> Tensor<f32> {
    let mut tensor = Tensor::zeros(shape);
    tensor
        .as_mut_slice()
        .iter_mut()
        .for_each(|x| *x = rng.f32() - 0.5);
    tensor
}

/// data -> conv -> pool -> conv -> deconv -> split -+-> sum -> softmax -> dropout -> fc
///                   \------------------------------/
fn network() -> Result<Graph, Box<dyn Error>> {
    let mut rng = fastrand::Rng::with_seed(42);
    let mut builder = Graph::builder();

    builder.add("data", Layer::Input(Input::default()), &[])?;

    let conv1 = Convolution::new(
        random(&mut rng, [4, 3, 3, 3]),
        random(&mut rng, [4]),
        1,
        1,
        Activation::ReLU,
    )?;
    builder.add("conv1", Layer::Convolution(conv1), &["data"])?;
    builder.add("pool1", Layer::Pool(Pool::new(2)?), &["conv1"])?;

    let conv2 = Convolution::new(
        random(&mut rng, [6, 4, 3, 3]),
        random(&mut rng, [6]),
        2,
        1,
        Activation::Tanh,
    )?;
    builder.add("conv2", Layer::Convolution(conv2), &["pool1"])?;

    let deconv = Deconvolution::new(
        random(&mut rng, [6, 4, 4, 4]),
        random(&mut rng, [4]),
        2,
        1,
        Activation::Sigmoid,
    )?;
    builder.add("deconv", Layer::Deconvolution(deconv), &["conv2"])?;
    builder.add("split", Layer::PassThrough, &["deconv"])?;
    builder.add("sum", Layer::Eltwise(Eltwise), &["pool1", "split"])?;
    builder.add("prob", Layer::Softmax(Softmax), &["sum"])?;
    builder.add("drop", Layer::Dropout(Dropout::new(0.25)?), &["prob"])?;

    let fc = FullyConnected::new(
        random(&mut rng, [5, 4 * 6 * 6]),
        random(&mut rng, [5]),
        Activation::Identity,
    )?;
    builder.add("fc", Layer::FullyConnected(fc), &["drop"])?;

    Ok(builder.build(SHAPE)?)
}

fn frames(count: usize) -> Vec<Tensor<f32>> {
    let mut rng = fastrand::Rng::with_seed(7);
    let mut frame = random(&mut rng, SHAPE);
    let mut frames = vec![frame.clone()];
    for _ in 1..count {
        // a small moving blob
        let (y, x) = (rng.usize(0..10), rng.usize(0..10));
        for c in 0..3 {
            for (dy, dx) in [(0, 0), (0, 1), (1, 0), (2, 2)] {
                frame[[c, y + dy, x + dx]] = rng.f32();
            }
        }
        frames.push(frame.clone());
    }
    frames
}

#[test]
fn test_shapes() -> Result<(), Box<dyn Error>> {
    let graph = network()?;
    let shape = |name: &str| graph.find(name).map(|id| graph.node(id).shape());
    assert_eq!(shape("conv1"), Some([4, 12, 12]));
    assert_eq!(shape("pool1"), Some([4, 6, 6]));
    assert_eq!(shape("conv2"), Some([6, 3, 3]));
    assert_eq!(shape("deconv"), Some([4, 6, 6]));
    assert_eq!(shape("split"), Some([4, 6, 6]));
    assert_eq!(shape("fc"), Some([5, 1, 1]));
    Ok(())
}

#[test]
fn test_masked_matches_dense() -> Result<(), Box<dyn Error>> {
    let mut dense = network()?;
    let mut masked = dense.clone();
    masked.set_masks_enabled(true);

    // any change at all marks a pixel dirty, so the masks cover every changed pixel
    let mut detector = ChangeDetector::new(0.0);

    for (index, frame) in frames(8).iter().enumerate() {
        dense.set_input(frame)?;
        dense.forward();

        masked.set_input(frame)?;
        masked.set_input_mask(&detector.detect(frame))?;
        masked.forward();

        for id in dense.ids() {
            assert_eq!(
                dense.output(id),
                masked.output(id),
                "frame {index}, node {}",
                dense.node(id).name()
            );
        }
        if index > 0 {
            let conv1 = masked.find("conv1").ok_or("conv1")?;
            assert!(masked.dirty_count(conv1) < 12 * 12);
        }
    }
    Ok(())
}

#[test]
fn test_clean_mask_keeps_outputs() -> Result<(), Box<dyn Error>> {
    let mut graph = network()?;
    graph.set_masks_enabled(true);
    let frames = frames(2);

    graph.set_input(&frames[0])?;
    graph.forward();
    let before = graph.ids().map(|id| graph.output(id).clone()).collect::<Vec<_>>();

    // the frame changed but nothing is reported dirty, so nothing is recomputed
    graph.set_input(&frames[1])?;
    graph.set_input_mask(&Tensor::zeros([12, 12]))?;
    graph.forward();

    for (id, before) in graph.ids().zip(&before).skip(1) {
        assert_eq!(graph.dirty_count(id), 0);
        assert_eq!(graph.output(id), before);
    }
    Ok(())
}

#[test]
fn test_reenabling_primes() -> Result<(), Box<dyn Error>> {
    let mut graph = network()?;
    let frames = frames(3);
    let fc = graph.find("fc").ok_or("fc")?;

    graph.set_masks_enabled(true);
    graph.set_input(&frames[0])?;
    graph.forward();
    assert_eq!(graph.node(fc).pass(), Pass::Masked);

    graph.set_masks_enabled(false);
    assert_eq!(graph.node(fc).pass(), Pass::Dense);
    graph.set_input(&frames[1])?;
    graph.forward();

    // priming ignores the stale input mask and recomputes everything
    graph.set_masks_enabled(true);
    graph.set_input(&frames[2])?;
    graph.set_input_mask(&Tensor::zeros([12, 12]))?;
    graph.forward();
    for id in graph.ids() {
        let [_, rows, cols] = graph.node(id).shape();
        assert_eq!(graph.dirty_count(id), rows * cols);
    }

    let mut dense = network()?;
    dense.set_input(&frames[2])?;
    dense.forward();
    assert_eq!(dense.output(fc), graph.output(fc));
    Ok(())
}

#[test]
fn test_runner() -> Result<(), Box<dyn Error>> {
    let config = RuntimeConfig {
        change_threshold: 10.0,
        mean: vec![100.0, 110.0, 120.0],
        ..Default::default()
    };
    let mut runner = Runner::new(network()?, config.clone())?;
    let mut reference = network()?;

    let mut frame = Tensor::filled(SHAPE, 128.0);
    for (index, percent) in [0, 4, 4, 16, 0].into_iter().enumerate() {
        change_percent_of_frame(&mut frame, percent);
        let report = runner.process(&frame)?;
        assert_eq!(report.dirty.len(), reference.len());
        // the first frame primes the graph densely
        assert_eq!(report.mask_injected, index > 0);

        let mut input = frame.clone();
        input.add_channel_bias(&config.mean.iter().map(|x| -x).collect::<Vec<_>>());
        reference.set_input(&input)?;
        reference.forward();
        let fc = reference.find("fc").ok_or("fc")?;
        assert_eq!(runner.graph().output(fc), reference.output(fc));
    }

    runner.set_mask_enabled(false);
    let report = runner.process(&frame)?;
    assert_eq!(report.frame, 5);
    assert!(!report.mask_injected);
    assert!(report.dirty.iter().all(|&(id, count)| {
        let [_, rows, cols] = runner.graph().node(id).shape();
        count == rows * cols
    }));
    Ok(())
}
