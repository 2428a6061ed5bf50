use criterion::{Criterion, criterion_group, criterion_main};
use knowledge_base::extractor::{MIME_MARKDOWN, MIME_PLAIN_TEXT, extract_text};
use std::hint::black_box;

const SECTION: &str = "## Renewal terms\n\n\
Contracts renew **annually** unless cancelled in writing. See the [policy](https://example.com/policy).\n\n\
| Tier | Seats | Price |\n|------|-------|-------|\n| Team | 10 | 400 |\n| Business | 50 | 1800 |\n\n\
- Invoices are issued on the first business day\n- Late payments accrue interest\n\n";

pub fn criterion_benchmark(c: &mut Criterion) {
    let markdown = SECTION.repeat(100);
    let plain = markdown.replace(['#', '*', '|'], "");

    c.bench_function("extraction_markdown", |b| {
        b.iter(|| extract_text(black_box(markdown.as_bytes()), MIME_MARKDOWN));
    });
    c.bench_function("extraction_plain_text", |b| {
        b.iter(|| extract_text(black_box(plain.as_bytes()), MIME_PLAIN_TEXT));
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
