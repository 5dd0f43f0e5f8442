use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use sqlserve::template::{compile, tokenize};

const HEADER: &str = "-- #description: Orders for a customer in a date range ##\n\
-- #in: customer = customer id; from = start date; to = end date; ##\n\
-- #out: id = order id; total = order total; placed_at = timestamp; ##\n\
-- #test: customer = 1; from = 2024-01-01; to = 2024-02-01; ##\n\
-- #testpass: rows ##\n\
-- #timeout: 1.5s ##\n";

fn generate_template(clauses: usize) -> String {
    let mut sql = String::from(HEADER);
    sql.push_str("SELECT id, total, placed_at FROM orders WHERE customer_id = :customer::int\n");
    for i in 0..clauses {
        sql.push_str(&format!(
            "  AND (note <> 'skip :customer {i}' \
             OR placed_at BETWEEN :from::date AND :to::date) /* clause {i} */\n"
        ));
    }
    sql.push_str("  AND body = $body$ literal :not_a_param $body$\n");
    sql
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");

    for clauses in [1, 10, 100, 1000] {
        let source = generate_template(clauses);
        group.bench_with_input(BenchmarkId::from_parameter(clauses), &source, |b, source| {
            b.iter(|| compile("orders/by_customer", black_box(source)))
        });
    }

    group.finish();
}

fn bench_tokenize(c: &mut Criterion) {
    let mut group = c.benchmark_group("tokenize");

    for clauses in [10, 1000] {
        let source = generate_template(clauses);
        group.bench_with_input(BenchmarkId::from_parameter(clauses), &source, |b, source| {
            b.iter(|| tokenize(black_box(source)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compile, bench_tokenize);
criterion_main!(benches);
