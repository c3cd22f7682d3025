use std::collections::{BTreeMap, VecDeque};

use statrs::statistics::Statistics;

/// Fixed ring capacity of a pair window.
pub const WINDOW_CAPACITY: usize = 100;

/// Minimum samples before a provisional correlation is usable.
pub const MIN_SAMPLES: usize = 20;

/// Bounded ring of paired return observations for one unordered symbol pair.
#[derive(Debug, Clone, Default)]
pub struct PairWindow {
    x: VecDeque<f64>,
    y: VecDeque<f64>,
}

impl PairWindow {
    pub fn push(&mut self, x: f64, y: f64) {
        if self.x.len() == WINDOW_CAPACITY {
            self.x.pop_front();
            self.y.pop_front();
        }
        self.x.push_back(x);
        self.y.push_back(y);
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Pearson correlation, defined once the window holds `MIN_SAMPLES`
    /// observations and both sides have dispersion.
    pub fn correlation(&self) -> Option<f64> {
        let n = self.len();
        if n < MIN_SAMPLES {
            return None;
        }
        let xs: Vec<f64> = self.x.iter().copied().collect();
        let ys: Vec<f64> = self.y.iter().copied().collect();
        let mean_x = xs.as_slice().mean();
        let mean_y = ys.as_slice().mean();
        let sx = xs.as_slice().std_dev();
        let sy = ys.as_slice().std_dev();
        if sx <= 0.0 || sy <= 0.0 {
            return None;
        }
        let cov = xs
            .iter()
            .zip(ys.iter())
            .map(|(a, b)| (a - mean_x) * (b - mean_y))
            .sum::<f64>()
            / (n as f64 - 1.0);
        Some((cov / (sx * sy)).clamp(-1.0, 1.0))
    }
}

/// All pairwise windows of a portfolio, keyed by integer symbol id. The
/// orchestrator owns the registry and is the only mutator; isolating a
/// symbol is a flag flip plus a purge of its windows.
#[derive(Debug)]
pub struct CorrelationTracker {
    symbols: Vec<String>,
    enabled: Vec<bool>,
    windows: Vec<PairWindow>,
}

impl CorrelationTracker {
    /// `symbols` must already be sorted; ids are positions in that order.
    pub fn new(symbols: Vec<String>) -> Self {
        let n = symbols.len();
        let pairs = n * n.saturating_sub(1) / 2;
        Self {
            symbols,
            enabled: vec![true; n],
            windows: (0..pairs).map(|_| PairWindow::default()).collect(),
        }
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_enabled(&self, id: usize) -> bool {
        self.enabled[id]
    }

    /// Triangular index of the unordered pair `(i, j)`, `i != j`.
    fn pair_index(&self, i: usize, j: usize) -> usize {
        let (lo, hi) = if i < j { (i, j) } else { (j, i) };
        // Offset of row `lo` in the upper triangle, then the column.
        lo * self.symbols.len() - lo * (lo + 1) / 2 + (hi - lo - 1)
    }

    /// Feed one bar of returns; `None` entries (missing or disabled) are
    /// skipped. A pair only advances when both sides have a return.
    pub fn record_returns(&mut self, returns: &[Option<f64>]) {
        debug_assert_eq!(returns.len(), self.symbols.len());
        for i in 0..self.symbols.len() {
            if !self.enabled[i] {
                continue;
            }
            let Some(ri) = returns[i] else { continue };
            for j in (i + 1)..self.symbols.len() {
                if !self.enabled[j] {
                    continue;
                }
                let Some(rj) = returns[j] else { continue };
                let idx = self.pair_index(i, j);
                self.windows[idx].push(ri, rj);
            }
        }
    }

    pub fn correlation(&self, i: usize, j: usize) -> Option<f64> {
        if i == j || !self.enabled[i] || !self.enabled[j] {
            return None;
        }
        self.windows[self.pair_index(i, j)].correlation()
    }

    /// Usable correlations keyed `"AAA:BBB"` in lexicographic order.
    pub fn correlation_map(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        for i in 0..self.symbols.len() {
            for j in (i + 1)..self.symbols.len() {
                if let Some(c) = self.correlation(i, j) {
                    map.insert(format!("{}:{}", self.symbols[i], self.symbols[j]), c);
                }
            }
        }
        map
    }

    /// Longest window currently held; reported on snapshots.
    pub fn max_window_len(&self) -> usize {
        self.windows.iter().map(PairWindow::len).max().unwrap_or(0)
    }

    /// Remove a symbol from all future correlation updates and drop its
    /// accumulated windows.
    pub fn isolate(&mut self, id: usize) {
        self.enabled[id] = false;
        for other in 0..self.symbols.len() {
            if other != id {
                let idx = self.pair_index(id, other);
                self.windows[idx] = PairWindow::default();
            }
        }
    }
}
