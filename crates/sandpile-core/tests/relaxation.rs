//! Integration tests for the relaxation engine across execution modes and
//! worker counts.

use std::collections::VecDeque;

use sandpile_core::simulation::kernel::DoubleBuffer;
use sandpile_core::{
    ExecutionMode, InitialFill, RelaxConfig, SandpileEngine, SandpileError, SandpileGrid,
};

/// Classic sequential toppling: repeatedly pick an unstable cell and topple
/// it once until none is left.
fn topple_sequentially(height: usize, width: usize, interior: &[u32]) -> Vec<u32> {
    let mut cells = interior.to_vec();
    let mut queue: VecDeque<usize> = (0..cells.len()).filter(|&i| cells[i] >= 4).collect();

    while let Some(i) = queue.pop_front() {
        if cells[i] < 4 {
            continue;
        }
        cells[i] -= 4;
        if cells[i] >= 4 {
            queue.push_back(i);
        }
        let (y, x) = (i / width, i % width);
        let neighbors = [
            (y > 0).then(|| i - width),
            (y + 1 < height).then(|| i + width),
            (x > 0).then(|| i - 1),
            (x + 1 < width).then(|| i + 1),
        ];
        for n in neighbors.into_iter().flatten() {
            cells[n] += 1;
            if cells[n] == 4 {
                queue.push_back(n);
            }
        }
    }
    cells
}

/// Deterministic pseudo-random interior in `0..13`.
fn scrambled(height: usize, width: usize, seed: u64) -> Vec<u32> {
    let mut state = seed;
    (0..height * width)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) % 13) as u32
        })
        .collect()
}

fn relax(grid: &SandpileGrid, mode: ExecutionMode, workers: usize) -> sandpile_core::RelaxReport {
    let config = RelaxConfig::new(grid.height, grid.width)
        .with_mode(mode)
        .with_workers(workers);
    SandpileEngine::new(config)
        .and_then(|engine| engine.run_from(grid))
        .unwrap_or_else(|err| panic!("{} with {} workers failed: {}", mode, workers, err))
}

#[test]
fn test_saturated_four_by_four() {
    let expected = [0, 3, 3, 0, 3, 2, 2, 3, 3, 2, 2, 3, 0, 3, 3, 0];
    let reference = topple_sequentially(4, 4, &[4; 16]);
    assert_eq!(reference, expected);

    for mode in ExecutionMode::ALL {
        for workers in [1, 2, 4] {
            let config = RelaxConfig::new(4, 4).with_mode(mode).with_workers(workers);
            let report = SandpileEngine::new(config).unwrap().run().unwrap();

            assert_eq!(report.grid.cells(), &expected, "{} / {}", mode, workers);
            assert_eq!(report.iterations, 5);
            assert_eq!(report.initial_grains, 64);
            assert_eq!(report.final_grains, 32);
        }
    }
}

#[test]
fn test_center_pile_matches_sequential_reference() {
    let grid = SandpileGrid::with_fill(3, 3, InitialFill::CenterPile { grains: 10 }).unwrap();
    let reference = topple_sequentially(3, 3, &grid.interior());
    assert_eq!(reference, [0, 2, 0, 2, 2, 2, 0, 2, 0]);

    for mode in ExecutionMode::ALL {
        for workers in 1..=3 {
            let report = relax(&grid, mode, workers);
            assert_eq!(report.grid.cells(), reference.as_slice());
            assert_eq!(report.iterations, 2);
        }
    }
}

#[test]
fn test_default_center_pile_uses_cell_count() {
    let config = RelaxConfig::new(5, 5)
        .with_fill(InitialFill::CenterPile { grains: 0 })
        .with_mode(ExecutionMode::MessagePassing)
        .with_workers(2);
    let report = SandpileEngine::new(config).unwrap().run().unwrap();

    assert_eq!(report.initial_grains, 25);
    assert_eq!(
        report.grid.cells(),
        &[0, 0, 1, 0, 0, 0, 2, 3, 2, 0, 1, 3, 1, 3, 1, 0, 2, 3, 2, 0, 0, 0, 1, 0, 0]
    );
    assert_eq!(report.iterations, 4);
}

#[test]
fn test_too_many_workers_is_configuration_error() {
    for mode in [ExecutionMode::SharedMemory, ExecutionMode::MessagePassing] {
        let err = SandpileEngine::new(RelaxConfig::new(3, 8).with_mode(mode).with_workers(4))
            .err()
            .unwrap();
        assert!(matches!(err, SandpileError::Configuration(_)), "{}", err);
    }
}

#[cfg(target_pointer_width = "64")]
#[test]
fn test_oversized_grid_fails_with_resource_error() {
    let side = 1usize << 33;
    for (mode, workers) in [(ExecutionMode::Serial, 1), (ExecutionMode::MessagePassing, 2)] {
        let result = SandpileEngine::new(
            RelaxConfig::new(side, side)
                .with_mode(mode)
                .with_workers(workers),
        )
        .and_then(|engine| engine.run());

        match result {
            Err(SandpileError::ResourceExhausted { .. }) => {}
            Err(other) => panic!("{}: unexpected error: {}", mode, other),
            Ok(_) => panic!("{}: oversized grid relaxed", mode),
        }
    }

    let err = SandpileGrid::new(side, side).unwrap_err();
    assert!(matches!(err, SandpileError::ResourceExhausted { .. }));
}

#[test]
fn test_single_worker_matches_four_workers() {
    let grid = SandpileGrid::from_interior(12, 9, &scrambled(12, 9, 7)).unwrap();

    let one = relax(&grid, ExecutionMode::MessagePassing, 1);
    let four = relax(&grid, ExecutionMode::MessagePassing, 4);

    assert_eq!(one.grid, four.grid);
    assert_eq!(one.iterations, four.iterations);
}

#[test]
fn test_partition_invariance() {
    let (height, width) = (34, 11);
    let grid = SandpileGrid::from_interior(height, width, &scrambled(height, width, 42)).unwrap();
    let reference = topple_sequentially(height, width, &grid.interior());

    let serial = relax(&grid, ExecutionMode::Serial, 1);
    assert_eq!(serial.grid.cells(), reference.as_slice());

    for mode in [ExecutionMode::SharedMemory, ExecutionMode::MessagePassing] {
        for workers in [1, 2, 4, 17] {
            let report = relax(&grid, mode, workers);
            assert_eq!(
                report.grid.cells(),
                reference.as_slice(),
                "{} with {} workers",
                mode,
                workers
            );
            assert_eq!(report.iterations, serial.iterations);
            assert_eq!(report.workers, workers);
        }
    }
}

#[test]
fn test_uneven_bands() {
    let init: Vec<u32> = (0..6)
        .flat_map(|y| (0..5).map(move |x| ((7 * y + 3 * x) % 13) as u32))
        .collect();
    let grid = SandpileGrid::from_interior(6, 5, &init).unwrap();
    let expected = [
        1, 2, 3, 2, 3, 2, 3, 2, 3, 3, 2, 2, 3, 2, 1, 1, 2, 2, 0, 3, 3, 3, 3, 2, 1, 2, 0, 2, 1, 3,
    ];
    assert_eq!(topple_sequentially(6, 5, &init), expected);

    for workers in [4, 5, 6] {
        for mode in [ExecutionMode::SharedMemory, ExecutionMode::MessagePassing] {
            let report = relax(&grid, mode, workers);
            assert_eq!(report.grid.cells(), &expected);
            assert_eq!(report.iterations, 19);
        }
    }
}

#[test]
fn test_rayon_sweep_on_large_grid() {
    let (height, width) = (160, 40);
    let grid = SandpileGrid::from_interior(height, width, &scrambled(height, width, 3)).unwrap();

    let serial = relax(&grid, ExecutionMode::Serial, 1);
    let rayon = relax(&grid, ExecutionMode::Rayon, 1);

    assert_eq!(serial.grid, rayon.grid);
    assert_eq!(serial.iterations, rayon.iterations);
}

#[test]
fn test_mass_never_increases() {
    let (rows, cols) = (10, 10);
    let interior = scrambled(rows, cols, 11);
    let mut buffers = DoubleBuffer::new(rows, cols).unwrap();
    for (y, values) in interior.chunks_exact(cols).enumerate() {
        buffers.row_mut(y + 1)[1..=cols].copy_from_slice(values);
    }

    let grains = |b: &DoubleBuffer| -> u64 {
        (1..=rows)
            .map(|y| b.row(y)[1..=cols].iter().map(|&c| u64::from(c)).sum::<u64>())
            .sum()
    };

    let mut previous = grains(&buffers);
    loop {
        let changed = buffers.sweep();
        buffers.swap();
        let current = grains(&buffers);
        assert!(current <= previous);
        previous = current;
        if !changed {
            break;
        }
    }
    assert!(buffers.is_stable());
}

#[test]
fn test_stable_result_is_idempotent() {
    let config = RelaxConfig::new(9, 7).with_mode(ExecutionMode::SharedMemory).with_workers(3);
    let first = SandpileEngine::new(config.clone()).unwrap().run().unwrap();
    assert!(first.grid.is_stable());
    assert!(first.grid.cells().iter().all(|&c| c <= 3));

    let stable = SandpileGrid::from_interior(9, 7, first.grid.cells()).unwrap();
    let second = SandpileEngine::new(config).unwrap().run_from(&stable).unwrap();

    assert_eq!(second.iterations, 1);
    assert_eq!(second.grid, first.grid);
    assert_eq!(second.grains_lost(), 0);
}

#[test]
fn test_config_file_drives_engine() {
    let config = RelaxConfig::from_toml_str(
        r#"
        height = 3
        width = 3
        workers = 3
        mode = "shared_memory"

        [fill]
        kind = "center_pile"
        grains = 10
        "#,
    )
    .unwrap();
    let report = SandpileEngine::new(config).unwrap().run().unwrap();

    assert_eq!(report.grid.cells(), &[0, 2, 0, 2, 2, 2, 0, 2, 0]);
    assert_eq!(report.grid.histogram(), [4, 0, 5, 0]);
}
