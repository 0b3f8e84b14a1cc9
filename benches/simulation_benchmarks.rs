use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use VoltSim::*;

fn bench_parse_and_op(c: &mut Criterion) {
    let mut group = c.benchmark_group("simple_circuit");

    let netlist_content = "\
* RC divider
V1 1 0 DC 5
R1 1 2 1k
R2 2 0 2k
C1 2 0 1n
.OP
.END
";

    group.bench_function("parse_netlist", |b| {
        b.iter(|| SpiceParser::new().parse_netlist(netlist_content).unwrap());
    });

    group.bench_function("operating_point", |b| {
        let parsed = SpiceParser::new().parse_netlist(netlist_content).unwrap();
        b.iter(|| {
            let mut solver = DcSolver::new(&parsed.circuit).unwrap();
            solver
                .solve(&parsed.circuit, parsed.circuit.initial_guess(), "operating point")
                .unwrap()
        });
    });

    group.finish();
}

fn bench_dense_lu_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("dense_lu");

    for size in [10, 50, 100, 200].iter() {
        group.bench_with_input(BenchmarkId::new("lu_solver", size), size, |b, &size| {
            use nalgebra::{DMatrix, DVector};

            // Tridiagonal SPD test matrix.
            let mut matrix = DMatrix::<f64>::identity(size, size);
            for i in 0..size {
                matrix[(i, i)] = 2.0;
                if i > 0 {
                    matrix[(i, i - 1)] = -1.0;
                    matrix[(i - 1, i)] = -1.0;
                }
            }
            let rhs = DVector::from_element(size, 1.0);

            b.iter(|| VoltSim::solver::solve_dense(&matrix, &rhs).unwrap());
        });
    }

    group.finish();
}

fn bench_transient(c: &mut Criterion) {
    let mut group = c.benchmark_group("transient_analysis");
    group.sample_size(20);

    let netlist_content = "\
* RC step response
V1 1 0 PULSE 0 5 0 1n 1n 1 2
R1 1 2 1k
C1 2 0 1n
.TRAN 1u 100u
.END
";

    group.bench_function("rc_step_100us", |b| {
        let parsed = SpiceParser::new().parse_netlist(netlist_content).unwrap();
        b.iter(|| {
            let spec = match &parsed.analysis {
                Analysis::Transient(spec) => spec.clone(),
                _ => unreachable!(),
            };
            let mut solver = TransientSolver::new(&parsed.circuit, spec).unwrap();
            let mut count = 0usize;
            solver.run(|_, _| count += 1).unwrap();
            count
        });
    });

    group.finish();
}

criterion_group!(benches, bench_parse_and_op, bench_dense_lu_sizes, bench_transient);
criterion_main!(benches);
