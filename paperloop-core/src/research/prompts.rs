//! Prompt construction for the four research calls.

use crate::brain::Message;
use crate::types::{Finding, PaperRef};
use std::collections::HashSet;
use std::fmt::Write;

const DIGEST_AUTHORS: usize = 3;
const DIGEST_CATEGORIES: usize = 3;
const DIGEST_SUMMARY_CHARS: usize = 500;

/// Render one digest block per paper, numbered from 1.
pub fn paper_digest(papers: &[PaperRef]) -> String {
    papers
        .iter()
        .enumerate()
        .map(|(i, paper)| {
            let summary: String = paper.summary.chars().take(DIGEST_SUMMARY_CHARS).collect();
            format!(
                "Paper {}:\n  Title: {}\n  arXiv ID: {}\n  Authors: {}\n  Published: {}\n  Categories: {}\n  Abstract: {}...\n  URL: {}\n",
                i + 1,
                paper.title,
                paper.id,
                author_line(&paper.authors, DIGEST_AUTHORS),
                paper.published_date(),
                paper
                    .categories
                    .iter()
                    .take(DIGEST_CATEGORIES)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
                summary,
                paper.abs_url,
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// First `limit` authors joined by commas, with " et al." when more exist.
pub fn author_line(authors: &[String], limit: usize) -> String {
    let mut line = authors
        .iter()
        .take(limit)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if authors.len() > limit {
        line.push_str(" et al.");
    }
    line
}

pub fn analysis_messages(topic: &str, query: &str, papers: &[PaperRef]) -> Vec<Message> {
    let prompt = format!(
        r#"You are a research agent evaluating arXiv papers for: {topic}

Query used: {query}

Papers found:
{digest}

Provide a DETAILED analysis of these research papers. Focus on:
- Key research contributions, methodologies, and techniques
- Specific experimental results, metrics, or benchmarks
- Novel approaches, architectures, or algorithms proposed
- Connections between papers and emerging research themes
- Identified research gaps or open problems
- Practical applications and potential impact
- Most influential or highly relevant papers for this topic

Return JSON with:
- "insights": String array of specific, technical insights from the papers
- "relevance_score": Number 1-10 (how relevant are these papers to the research topic)
- "summary": Brief summary of the research landscape
- "key_points": Array of most important research findings
- "research_gaps": Array of identified gaps or future research directions"#,
        digest = paper_digest(papers),
    );
    vec![
        Message::system(
            "You are a research evaluation agent. Analyze arXiv papers and provide structured insights in JSON format. Focus on technical depth and research value.",
        ),
        Message::user(prompt),
    ]
}

pub fn continuation_messages(
    topic: &str,
    findings: &[Finding],
    current_iteration: u32,
    max_iterations: u32,
) -> Vec<Message> {
    let summary = findings
        .iter()
        .map(|f| {
            format!(
                "Query: {}\nSummary: {}\nRelevance: {}/10\nPapers found: {}",
                f.query,
                f.summary,
                f.relevance_score,
                f.top_papers.len()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let prompt = format!(
        r#"You are a research agent investigating: {topic}

Current iteration: {current_iteration}/{max_iterations}

Findings so far:
{summary}

Average relevance score: {average:.1}/10

Decide whether to continue research or conclude. Continue if:
1. Current iteration is less than 75% of max_iterations
2. Average relevance is above 6.0 and there are likely unexplored aspects
3. Recent queries found significant new papers with valuable insights
4. There are identified research gaps worth exploring

Only stop early if:
- Average relevance is below 5.0 for multiple iterations
- No new meaningful information in the last 2 iterations
- The topic has been comprehensively covered

Return JSON with:
- "should_continue": boolean"#,
        average = average_relevance(findings),
    );
    vec![
        Message::system(
            "You are a research decision agent. Evaluate research completeness and decide whether to continue. Return JSON.",
        ),
        Message::user(prompt),
    ]
}

pub fn average_relevance(findings: &[Finding]) -> f64 {
    if findings.is_empty() {
        return 0.0;
    }
    let total: u32 = findings.iter().map(|f| u32::from(f.relevance_score)).sum();
    f64::from(total) / findings.len() as f64
}

pub fn follow_up_messages(topic: &str, findings: &[Finding], iteration: u32) -> Vec<Message> {
    let summary = findings
        .iter()
        .map(|f| {
            format!(
                "Query: {}\nSummary: {}\nKey insights: {:?}\nResearch gaps: {:?}",
                f.query, f.summary, f.insights, f.research_gaps
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let prompt = format!(
        r#"You are a research agent investigating: {topic}

This is iteration {iteration} of your research.

Current findings:
{summary}

Generate 2-4 SHORT KEYWORD-BASED search queries for arXiv that explore DIVERSE aspects of {topic}.

CRITICAL RULES:
1. Use SHORT keywords (2-5 words max) - NOT long sentences
2. Focus on DIFFERENT aspects, methodologies, or applications
3. Use terms that appear in actual arXiv paper titles
4. Consider exploring identified research gaps
5. Avoid repeating previous queries

GOOD examples: ["transformer attention mechanisms", "neural network pruning", "federated learning privacy"]
BAD examples: ["What are the latest advances in transformer-based architectures for natural language processing?"]

Return only a JSON array of SHORT keyword queries: ["query1", "query2", "query3"]"#
    );
    vec![
        Message::system(
            "You are a research agent. Generate focused follow-up queries for arXiv search. Return only JSON array.",
        ),
        Message::user(prompt),
    ]
}

/// One entry of the synthesis citation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Citation {
    pub number: usize,
    pub authors: String,
    pub title: String,
    pub published: String,
    pub abs_url: String,
}

impl std::fmt::Display for Citation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}: \"{}\" ({}) - {}",
            self.number, self.authors, self.title, self.published, self.abs_url
        )
    }
}

/// Citations across all findings, deduplicated by paper id in first-seen order.
///
/// Papers without an id are skipped.
pub fn citations(findings: &[Finding]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for paper in findings.iter().flat_map(|f| f.top_papers.iter()) {
        if paper.id.is_empty() || !seen.insert(paper.id.as_str()) {
            continue;
        }
        let mut authors = paper
            .authors
            .first()
            .cloned()
            .unwrap_or_else(|| "Unknown".to_string());
        if paper.authors.len() > 1 {
            authors.push_str(" et al.");
        }
        out.push(Citation {
            number: out.len() + 1,
            authors,
            title: paper.title.clone(),
            published: paper.published_date(),
            abs_url: paper.abs_url.clone(),
        });
    }
    out
}

pub fn synthesis_messages(topic: &str, findings: &[Finding]) -> Vec<Message> {
    let mut findings_text = String::new();
    for (i, f) in findings.iter().enumerate() {
        let _ = write!(
            findings_text,
            "\n=== Finding {} ===\nQuery: {}\nSummary: {}\nKey Points: {:?}\nInsights: {:?}\nResearch Gaps: {:?}\n",
            i + 1,
            f.query,
            f.summary,
            f.key_points,
            f.insights,
            f.research_gaps
        );
    }
    let citations_text = citations(findings)
        .iter()
        .map(Citation::to_string)
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        r#"You are a research analyst. Synthesize the following arXiv research findings into a comprehensive,
detailed report about: {topic}

Research Findings:
{findings_text}

Available Paper Citations:
{citations_text}

Create a comprehensive research report that flows naturally as a single narrative. Include:
- Overview of the research landscape and current state of the field
- Key methodologies, techniques, and approaches in the literature
- Important experimental results, benchmarks, and comparisons
- Emerging trends and research directions
- Identified gaps and opportunities for future research
- Practical implications and applications
- INLINE LINKS: When referencing papers, include clickable links using [paper title](URL) format

Structure the report with clear sections:
1. Executive Summary
2. Research Landscape Overview
3. Key Findings and Methodologies
4. Emerging Trends
5. Research Gaps and Future Directions
6. Conclusions

Return a JSON object with this exact structure:
{{
    "report": "A comprehensive research report..."
}}"#
    );
    vec![
        Message::system(
            "You are a research analyst specializing in academic literature review. Provide comprehensive synthesis in JSON format.",
        ),
        Message::user(prompt),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn paper(id: &str, authors: &[&str]) -> PaperRef {
        PaperRef {
            id: id.into(),
            title: format!("Title {}", id),
            authors: authors.iter().map(|a| a.to_string()).collect(),
            summary: "x".repeat(800),
            published: "2023-03-14T09:00:00Z".into(),
            categories: vec!["cs.LG".into(), "cs.AI".into(), "stat.ML".into(), "cs.CV".into()],
            abs_url: format!("https://arxiv.org/abs/{}", id),
            ..Default::default()
        }
    }

    fn finding(query: &str, papers: Vec<PaperRef>, relevance: u8) -> Finding {
        Finding {
            query: query.into(),
            insights: vec![],
            relevance_score: relevance,
            summary: format!("summary of {}", query),
            key_points: vec![],
            research_gaps: vec![],
            top_papers: papers,
        }
    }

    #[test]
    fn test_author_line() {
        let four: Vec<String> = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
        assert_eq!(author_line(&four, 3), "A, B, C et al.");
        assert_eq!(author_line(&four[..3], 3), "A, B, C");
        assert_eq!(author_line(&[], 3), "");
    }

    #[test]
    fn test_digest_truncates_fields() {
        let digest = paper_digest(&[paper("2303.1", &["A", "B", "C", "D"])]);
        assert!(digest.starts_with("Paper 1:\n  Title: Title 2303.1\n"));
        assert!(digest.contains("Authors: A, B, C et al.\n"));
        assert!(digest.contains("Published: 2023-03-14\n"));
        assert!(digest.contains("Categories: cs.LG, cs.AI, stat.ML\n"));
        assert!(!digest.contains("cs.CV"));
        assert!(digest.contains(&format!("Abstract: {}...\n", "x".repeat(500))));
        assert!(!digest.contains(&"x".repeat(501)));
        assert!(digest.contains("URL: https://arxiv.org/abs/2303.1\n"));
    }

    #[test]
    fn test_citations_dedup_in_first_seen_order() {
        let findings = vec![
            finding("a", vec![paper("1", &["Ada", "Bob"]), paper("2", &["Cy"])], 7),
            finding("b", vec![paper("2", &["Cy"]), paper("3", &[])], 4),
        ];
        let cites = citations(&findings);
        assert_eq!(cites.len(), 3);
        assert_eq!(
            cites[0].to_string(),
            "[1] Ada et al.: \"Title 1\" (2023-03-14) - https://arxiv.org/abs/1"
        );
        assert_eq!(cites[1].authors, "Cy");
        assert_eq!(cites[2].authors, "Unknown");
        assert_eq!(cites[2].number, 3);
    }

    #[test]
    fn test_average_relevance() {
        assert_eq!(average_relevance(&[]), 0.0);
        let findings = vec![finding("a", vec![], 7), finding("b", vec![], 0)];
        assert_eq!(average_relevance(&findings), 3.5);
        let msgs = continuation_messages("gnn", &findings, 2, 3);
        assert!(msgs[1].content.contains("Average relevance score: 3.5/10"));
        assert!(msgs[1].content.contains("Current iteration: 2/3"));
    }

    #[test]
    fn test_synthesis_prompt_lists_findings_and_citations() {
        let findings = vec![finding("gnn", vec![paper("1", &["Ada"])], 8)];
        let msgs = synthesis_messages("graph learning", &findings);
        assert_eq!(msgs.len(), 2);
        let user = &msgs[1].content;
        assert!(user.contains("=== Finding 1 ===\nQuery: gnn"));
        assert!(user.contains("[1] Ada: \"Title 1\""));
        assert!(user.contains("\"report\""));
    }

    #[test]
    fn test_follow_up_prompt_mentions_iteration() {
        let msgs = follow_up_messages("gnn", &[finding("gnn", vec![], 6)], 2);
        assert!(msgs[1].content.contains("This is iteration 2 of your research."));
    }
}
