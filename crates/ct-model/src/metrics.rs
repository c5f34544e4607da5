//! Classification metrics computed from a confusion matrix.

/// `matrix[true][predicted]` counts over a fixed class set.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    matrix: Vec<Vec<usize>>,
    nclasses: usize,
}

impl ConfusionMatrix {
    pub fn new(nclasses: usize) -> Self {
        Self {
            matrix: vec![vec![0; nclasses]; nclasses],
            nclasses,
        }
    }

    /// Labels outside `0..nclasses` are ignored.
    pub fn from_predictions(y_pred: &[usize], y_true: &[usize], nclasses: usize) -> Self {
        let mut cm = Self::new(nclasses);
        for (&pred, &truth) in y_pred.iter().zip(y_true) {
            cm.add(truth, pred);
        }
        cm
    }

    pub fn add(&mut self, truth: usize, pred: usize) {
        if truth < self.nclasses && pred < self.nclasses {
            self.matrix[truth][pred] += 1;
        }
    }

    pub fn matrix(&self) -> &[Vec<usize>] {
        &self.matrix
    }

    pub fn nclasses(&self) -> usize {
        self.nclasses
    }

    pub fn total(&self) -> usize {
        self.matrix.iter().flatten().sum()
    }

    fn row_sum(&self, class: usize) -> usize {
        self.matrix[class].iter().sum()
    }

    fn col_sum(&self, class: usize) -> usize {
        self.matrix.iter().map(|row| row[class]).sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let correct: usize = (0..self.nclasses).map(|i| self.matrix[i][i]).sum();
        correct as f64 / total as f64
    }

    /// Cohen's kappa: agreement corrected for chance. Degenerate matrices
    /// (empty, or chance agreement of 1) score 0.
    pub fn kappa(&self) -> f64 {
        let total = self.total() as f64;
        if total == 0.0 {
            return 0.0;
        }
        let observed = self.accuracy();
        let expected: f64 = (0..self.nclasses)
            .map(|c| self.row_sum(c) as f64 * self.col_sum(c) as f64)
            .sum::<f64>()
            / (total * total);
        if (1.0 - expected).abs() < f64::EPSILON {
            return 0.0;
        }
        (observed - expected) / (1.0 - expected)
    }

    pub fn precision(&self, class: usize) -> f64 {
        let predicted = self.col_sum(class);
        if predicted == 0 {
            0.0
        } else {
            self.matrix[class][class] as f64 / predicted as f64
        }
    }

    pub fn recall(&self, class: usize) -> f64 {
        let support = self.row_sum(class);
        if support == 0 {
            0.0
        } else {
            self.matrix[class][class] as f64 / support as f64
        }
    }

    pub fn f1(&self, class: usize) -> f64 {
        let p = self.precision(class);
        let r = self.recall(class);
        if p + r > 0.0 {
            2.0 * p * r / (p + r)
        } else {
            0.0
        }
    }

    fn macro_average(&self, metric: impl Fn(usize) -> f64) -> f64 {
        if self.nclasses == 0 {
            return 0.0;
        }
        (0..self.nclasses).map(metric).sum::<f64>() / self.nclasses as f64
    }

    pub fn macro_precision(&self) -> f64 {
        self.macro_average(|c| self.precision(c))
    }

    pub fn macro_recall(&self) -> f64 {
        self.macro_average(|c| self.recall(c))
    }

    pub fn macro_f1(&self) -> f64 {
        self.macro_average(|c| self.f1(c))
    }

    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.matrix
            .iter()
            .map(|row| row.iter().map(|&v| v as f64).collect())
            .collect()
    }
}
