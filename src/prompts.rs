//! Prompt templates for essay writing, judging and prompt generation.
//!
//! Templates are plain strings with `{name}` placeholders. Judge templates
//! end with a fixed-format marker line that [`crate::judge::extract`] parses.

use crate::gateway::Message;

// =============================================================================
// Templates
// =============================================================================

/// Rendered prompt ready for the model.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    /// Empty when the template has no system turn.
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if !self.system.is_empty() {
            messages.push(Message::system(&self.system));
        }
        messages.push(Message::user(&self.user));
        messages
    }
}

/// A prompt template with `{name}` placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    pub fn render(&self, vars: &[(&str, &str)]) -> PromptInstance {
        PromptInstance {
            template_slug: self.slug,
            system: fill(self.system, vars).trim().to_string(),
            user: fill(self.user, vars),
        }
    }
}

/// Substitute `{name}` placeholders in one left-to-right pass over `template`.
///
/// Substituted values are copied verbatim and never scanned again. Braces
/// that do not name a known variable are kept as written.
fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let known = after.find('}').and_then(|close| {
            let name = &after[..close];
            vars.iter()
                .find(|(var, _)| *var == name)
                .map(|(_, value)| (*value, close))
        });
        match known {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

// =============================================================================
// Essay writing
// =============================================================================

pub const ESSAY: PromptTemplate = PromptTemplate {
    slug: "essay_v1",
    system: "",
    user: "请根据以下题目写一篇作文：{prompt}",
};

pub fn essay(prompt: &str) -> PromptInstance {
    ESSAY.render(&[("prompt", prompt)])
}

// =============================================================================
// Judging
// =============================================================================

pub const SINGLE_SCORE: PromptTemplate = PromptTemplate {
    slug: "single_score_v1",
    system: r#"你是一位专业的作文评分专家，需要对给定的作文进行评分。
评分标准（1-10分）：
1. 内容相关性（30%）：是否紧扣题目要求，主题明确
2. 结构合理性（25%）：逻辑清晰，层次分明，有开头、主体和结尾
3. 语言表达（30%）：用词准确，语句通顺，有文采
4. 创新性（15%）：观点新颖，表达方式独特

请先给出整体评价（50字以内），然后给出具体分数（仅输出数字，如"8.5"），格式如下：
评价：[你的评价]
分数：[1-10的数字]"#,
    user: "题目：{prompt}\n回答：{response}",
};

pub const PAIRWISE: PromptTemplate = PromptTemplate {
    slug: "pairwise_v1",
    system: r#"你是一位专业的作文评分专家，需要对比两篇同题作文的优劣。
对比维度：
1. 内容相关性：是否紧扣题目
2. 结构合理性：逻辑与层次
3. 语言表达：准确性与流畅度
4. 创新性：观点与表达

请先说明哪篇更优及原因（50字以内），然后给出偏好概率（0-100%，表示更偏好A的概率），格式如下：
评价：[你的评价]
偏好A的概率：[0-100的数字]%"#,
    user: "题目：{prompt}\nA的回答：{response_a}\nB的回答：{response_b}",
};

pub fn single_score(prompt: &str, response: &str) -> PromptInstance {
    SINGLE_SCORE.render(&[("prompt", prompt), ("response", response)])
}

pub fn pairwise(prompt: &str, response_a: &str, response_b: &str) -> PromptInstance {
    PAIRWISE.render(&[
        ("prompt", prompt),
        ("response_a", response_a),
        ("response_b", response_b),
    ])
}

// =============================================================================
// Prompt generation
// =============================================================================

pub const GENERATE_TOPICS: PromptTemplate = PromptTemplate {
    slug: "generate_topics_v1",
    system: r#"你是一位专业的教育工作者，需要生成多样化的作文题目。
要求:
1. 题目类型包括记叙文、议论文、说明文、应用文等
2. 主题涵盖成长感悟、社会热点、文化传承、科技发展、环境保护、人际交往、理想信念、读书感悟、家乡变化等多个领域
3. 难度适中，适合中学生至大学生水平
4. 每个题目需简洁明了（10-30字），具有明确的写作方向
5. 避免重复或相似度过高的题目
请生成{count}个作文题目，每个题目单独一行，不要编号，不要添加额外说明。"#,
    user: "请生成上述要求的作文题目",
};

pub const TOP_UP_TOPICS: PromptTemplate = PromptTemplate {
    slug: "top_up_topics_v1",
    system: r#"请补充生成{count}个作文题目，要求：
1. 与已有题目不重复、不相似
2. 已有题目关键词：{keywords}
3. 每个题目单独一行，不要编号
{strict_rule}"#,
    user: "请生成新的作文题目，确保多样性",
};

const STRICT_RULE: &str = "4. 严格避免与上述关键词重复的主题";

pub fn generate_topics(count: usize) -> PromptInstance {
    GENERATE_TOPICS.render(&[("count", &count.to_string())])
}

pub fn top_up_topics(count: usize, keywords: &[String], strict: bool) -> PromptInstance {
    TOP_UP_TOPICS.render(&[
        ("count", &count.to_string()),
        ("keywords", &keywords.join(", ")),
        ("strict_rule", if strict { STRICT_RULE } else { "" }),
    ])
}

// =============================================================================
// TESTS
// =============================================================================
