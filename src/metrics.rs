//! The fixed set of metrics reported per answer pair and on the leaderboard

use std::fmt;

/// How a per-example mean is presented on the leaderboard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scaling {
    /// Fraction in 0..=1, shown on a 0..=100 scale
    Percent,
    /// Distance or probability style value, shown as is
    Raw,
}

impl Scaling {
    pub fn apply(&self, value: f64) -> f64 {
        match self {
            Scaling::Percent => value * 100.0,
            Scaling::Raw => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
    F1,
    Bert,
    Bleu,
    SentenceSim,
    Meteor,
    Rouge,
    SimHash,
    Perplexity,
    Bleurt,
}

impl Metric {
    /// All metrics in report order
    pub const ALL: [Metric; 9] = [
        Metric::F1,
        Metric::Bert,
        Metric::Bleu,
        Metric::SentenceSim,
        Metric::Meteor,
        Metric::Rouge,
        Metric::SimHash,
        Metric::Perplexity,
        Metric::Bleurt,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Metric::F1 => "f1",
            Metric::Bert => "bert",
            Metric::Bleu => "bleu",
            Metric::SentenceSim => "sentence_sim",
            Metric::Meteor => "meteor",
            Metric::Rouge => "rouge",
            Metric::SimHash => "simhash",
            Metric::Perplexity => "perplexity",
            Metric::Bleurt => "bleurt",
        }
    }

    /// Column written next to each answer pair by the dataset scorer
    pub fn score_column(&self) -> &'static str {
        match self {
            Metric::F1 => "F1 score",
            Metric::Bert => "bert score",
            Metric::Bleu => "BLEU score",
            Metric::SentenceSim => "SentenceSim score",
            Metric::Meteor => "meteor score",
            Metric::Rouge => "rouge score",
            Metric::SimHash => "SimHash score",
            Metric::Perplexity => "perplexity score",
            Metric::Bleurt => "bleurt score",
        }
    }

    /// Column name on the leaderboard
    pub fn label(&self) -> &'static str {
        match self {
            Metric::F1 => "F1 Score",
            Metric::Bert => "BERT Score",
            Metric::Bleu => "BLEU Score",
            Metric::SentenceSim => "SentenceSim Score",
            Metric::Meteor => "Meteor Score",
            Metric::Rouge => "Rouge Score",
            Metric::SimHash => "SimHash Score",
            Metric::Perplexity => "Perplexity Score",
            Metric::Bleurt => "Bleurt Score",
        }
    }

    /// Older column spellings still found in score files
    fn aliases(&self) -> &'static [&'static str] {
        match self {
            Metric::Bleu => &["blue score"],
            _ => &[],
        }
    }

    pub fn scaling(&self) -> Scaling {
        match self {
            Metric::SimHash | Metric::Perplexity | Metric::Bleurt => Scaling::Raw,
            _ => Scaling::Percent,
        }
    }

    pub fn lower_is_better(&self) -> bool {
        matches!(self, Metric::SimHash | Metric::Perplexity)
    }

    /// Whether a score-file column holds this metric (case-insensitive)
    pub fn matches_column(&self, column: &str) -> bool {
        let column = column.trim();
        column.eq_ignore_ascii_case(self.score_column())
            || column.eq_ignore_ascii_case(self.label())
            || self
                .aliases()
                .iter()
                .any(|alias| column.eq_ignore_ascii_case(alias))
    }

    /// Index of the first header that holds this metric
    pub fn find_column<'a, I>(&self, headers: I) -> Option<usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        headers
            .into_iter()
            .position(|header| self.matches_column(header))
    }

    /// File-name friendly form of the label, e.g. `f1_score`
    pub fn slug(&self) -> String {
        self.label().to_lowercase().replace(' ', "_")
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_match_is_case_insensitive() {
        assert!(Metric::F1.matches_column("f1 score"));
        assert!(Metric::F1.matches_column("F1 Score"));
        assert!(Metric::Bleu.matches_column("Blue Score"));
        assert!(Metric::Bleu.matches_column("bleu score"));
        assert!(!Metric::Bleu.matches_column("bleurt score"));
    }

    #[test]
    fn test_find_column() {
        let headers = ["question", "ideal_answer", "answer", "rouge score", "F1 score"];
        assert_eq!(Metric::F1.find_column(headers), Some(4));
        assert_eq!(Metric::Rouge.find_column(headers), Some(3));
        assert_eq!(Metric::Bleurt.find_column(headers), None);
    }

    #[test]
    fn test_scaling() {
        let percent: Vec<Metric> = Metric::ALL
            .into_iter()
            .filter(|m| m.scaling() == Scaling::Percent)
            .collect();
        assert_eq!(
            percent,
            vec![
                Metric::F1,
                Metric::Bert,
                Metric::Bleu,
                Metric::SentenceSim,
                Metric::Meteor,
                Metric::Rouge
            ]
        );
        assert_eq!(Metric::F1.scaling().apply(0.25), 25.0);
        assert_eq!(Metric::Perplexity.scaling().apply(3.5), 3.5);
    }

    #[test]
    fn test_slug() {
        assert_eq!(Metric::F1.slug(), "f1_score");
        assert_eq!(Metric::SentenceSim.slug(), "sentencesim_score");
    }
}
