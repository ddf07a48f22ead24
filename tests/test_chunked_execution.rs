use ndarray::Array2;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use topocomplexity::core::{partition, ChunkPartitioner};
use topocomplexity::{
    analyze, AnalysisParams, DemInput, EdgeMode, ExecutorParams, GridSpacing, Metric,
    Parallelism, RugosityMethod, TerrainAnalyzer, TopoError,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn terrain(rows: usize, cols: usize) -> DemInput {
    let grid = Array2::from_shape_fn((rows, cols), |(i, j)| {
        let (x, y) = (j as f64 * 0.37, i as f64 * 0.29);
        450.0 + 25.0 * x.sin() * y.cos() + 6.0 * (2.3 * x + 0.7 * y).sin() + 0.05 * (i * j) as f64
    });
    DemInput::new(grid, GridSpacing::new(2.0, 3.0).unwrap(), None).unwrap()
}

fn sequential() -> ExecutorParams {
    ExecutorParams {
        parallelism: Parallelism::Sequential,
        item_budget: None,
    }
}

/// Bitwise comparison treating all NaNs as equal
fn assert_bit_identical(a: &Array2<f64>, b: &Array2<f64>, label: &str) {
    assert_eq!(a.dim(), b.dim());
    for ((index, &x), &y) in a.indexed_iter().zip(b.iter()) {
        let same = (x.is_nan() && y.is_nan()) || x.to_bits() == y.to_bits();
        assert!(same, "{}: cell {:?} differs ({} vs {})", label, index, x, y);
    }
}

#[test]
fn test_chunked_matches_single_chunk() {
    init_logging();

    let input = terrain(37, 41);
    let metrics = [
        Metric::Tpi,
        Metric::Rugosity {
            method: RugosityMethod::ArcChord,
        },
        Metric::Rugosity {
            method: RugosityMethod::SurfaceRatio,
        },
        Metric::FractalDimension,
    ];

    for metric in metrics {
        for window_size in [5, 7] {
            let reference = analyze(
                &input,
                AnalysisParams {
                    window_size,
                    chunk_size: None,
                    executor: sequential(),
                    ..AnalysisParams::for_metric(metric)
                },
            )
            .unwrap();
            assert_eq!(reference.report.work_items, 1);

            for chunk_size in [window_size + 1, 12, 16, 64] {
                let start = Instant::now();
                let chunked = analyze(
                    &input,
                    AnalysisParams {
                        window_size,
                        chunk_size: Some(chunk_size),
                        ..AnalysisParams::for_metric(metric)
                    },
                )
                .unwrap();

                println!(
                    "{} w={} chunk={}: {} chunks in {:.3}s",
                    metric.name(),
                    window_size,
                    chunk_size,
                    chunked.report.work_items,
                    start.elapsed().as_secs_f64()
                );

                let label = format!("{} w={} chunk={}", metric.name(), window_size, chunk_size);
                assert_bit_identical(&reference.result, &chunked.result, &label);
                assert_eq!(chunked.report.degenerate_cells, reference.report.degenerate_cells);
            }
        }
    }
}

#[test]
fn test_edge_modes_are_chunk_independent() {
    init_logging();

    let input = terrain(23, 19);
    for edge_mode in [EdgeMode::Clamp, EdgeMode::Mask, EdgeMode::Reject] {
        let params = |chunk_size| AnalysisParams {
            window_size: 5,
            chunk_size,
            edge_mode: Some(edge_mode),
            border: topocomplexity::BorderPolicy::Keep,
            ..AnalysisParams::for_metric(Metric::Tpi)
        };

        let single = analyze(&input, params(None)).unwrap();
        let chunked = analyze(&input, params(Some(9))).unwrap();
        assert_bit_identical(&single.result, &chunked.result, &format!("{:?}", edge_mode));
    }
}

#[test]
fn test_worker_counts_agree() {
    init_logging();

    let input = terrain(40, 40);
    let run = |parallelism| {
        analyze(
            &input,
            AnalysisParams {
                window_size: 5,
                chunk_size: Some(10),
                executor: ExecutorParams {
                    parallelism,
                    item_budget: None,
                },
                ..AnalysisParams::for_metric(Metric::FractalDimension)
            },
        )
        .unwrap()
        .result
    };

    let reference = run(Parallelism::Sequential);
    assert_bit_identical(&reference, &run(Parallelism::Auto), "auto");
    assert_bit_identical(&reference, &run(Parallelism::Threads(3)), "threads(3)");
}

#[test]
fn test_partition_covers_grid_once() {
    for (shape, radius, chunk_size) in [
        ((1, 1), 0, 1),
        ((10, 10), 1, 3),
        ((17, 5), 2, 9),
        ((64, 33), 3, 20),
        ((100, 7), 4, 100),
    ] {
        let mut hits = Array2::<u8>::zeros(shape);
        for chunk in partition(shape, radius, chunk_size).unwrap() {
            assert!(chunk.interior.rows() <= chunk_size && chunk.interior.cols() <= chunk_size);
            assert!(chunk.extent.rows() <= chunk_size + 2 * radius);
            assert!(chunk.extent.cols() <= chunk_size + 2 * radius);
            for i in chunk.interior.row_start..chunk.interior.row_end {
                for j in chunk.interior.col_start..chunk.interior.col_end {
                    hits[[i, j]] += 1;
                }
            }
        }
        assert!(hits.iter().all(|&h| h == 1), "{:?} r={} c={}", shape, radius, chunk_size);

        // Restartable: the same value yields the same chunks again
        let partitioner = ChunkPartitioner::new(shape, radius, chunk_size).unwrap();
        let first: Vec<_> = partitioner.iter().collect();
        let second: Vec<_> = partitioner.iter().collect();
        assert_eq!(first, second);
    }
}

#[test]
fn test_small_chunk_rejected_before_work() {
    init_logging();

    assert!(matches!(
        partition((50, 50), 3, 6),
        Err(TopoError::InvalidConfig(_))
    ));

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let analyzer = TerrainAnalyzer::new(AnalysisParams {
        window_size: 7,
        chunk_size: Some(6),
        ..AnalysisParams::default()
    });
    assert!(matches!(analyzer, Err(TopoError::InvalidConfig(_))));

    // Smallest accepted chunk: a 7x7 interior read with a 3-cell border
    let analyzer = TerrainAnalyzer::new(AnalysisParams {
        window_size: 7,
        chunk_size: Some(7),
        ..AnalysisParams::default()
    })
    .unwrap()
    .with_progress_callback(Arc::new(move |_: usize, _: usize| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let input = terrain(8, 9);
    let output = analyzer.analyze(&input).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(output.report.work_items, 4);

    let single = analyze(
        &input,
        AnalysisParams {
            window_size: 7,
            chunk_size: None,
            ..AnalysisParams::default()
        },
    )
    .unwrap();
    assert_bit_identical(&single.result, &output.result, "one-cell chunks");
}

#[test]
fn test_progress_reports_every_chunk() {
    init_logging();

    let seen = Arc::new(Mutex::new(HashSet::new()));
    let sink = Arc::clone(&seen);
    let analyzer = TerrainAnalyzer::new(AnalysisParams {
        window_size: 3,
        chunk_size: Some(7),
        ..AnalysisParams::default()
    })
    .unwrap()
    .with_progress_callback(Arc::new(move |completed: usize, total: usize| {
        assert_eq!(total, 16);
        sink.lock().unwrap().insert(completed);
    }));

    let output = analyzer.analyze(&terrain(25, 25)).unwrap();
    assert_eq!(output.report.work_items, 16);
    assert_eq!(output.report.completed_items, 16);
    assert_eq!(analyzer.progress().completed(), 16);
    assert_eq!(*seen.lock().unwrap(), (1..=16).collect::<HashSet<_>>());
}

#[test]
fn test_cancelled_run_returns_cancelled() {
    init_logging();

    let analyzer = TerrainAnalyzer::new(AnalysisParams {
        window_size: 3,
        chunk_size: Some(8),
        executor: sequential(),
        ..AnalysisParams::default()
    })
    .unwrap();

    // Cancel from inside the run once a few chunks are done
    let token = analyzer.cancellation_token();
    let analyzer = analyzer.with_progress_callback(Arc::new(move |completed: usize, _: usize| {
        if completed == 3 {
            token.cancel();
        }
    }));

    match analyzer.analyze(&terrain(30, 30)) {
        Err(TopoError::Cancelled { completed, total }) => {
            assert_eq!(completed, 3);
            assert_eq!(total, 16);
        }
        other => panic!("expected Cancelled, got {:?}", other.map(|o| o.report)),
    }
}
