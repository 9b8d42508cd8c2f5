// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use criterion::{criterion_group, criterion_main, Criterion};
use matcher::domain::SuffixTrie;

fn bench_match(c: &mut Criterion) {
    let mut matcher = SuffixTrie::new();
    for i in 0..73_300u32 {
        matcher.insert(&format!("site{}.example.com", i), ());
    }
    matcher.insert("baidu.com", ());

    c.bench_function("match", |b| {
        b.iter(|| assert!(matcher.matches("store.www.baidu.com")))
    });
}

criterion_group!(benches, bench_match);
criterion_main!(benches);
