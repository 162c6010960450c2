//! Keyword intent detection for teacher-to-teacher hand-off.

use converse_types::AgentType;

/// Words and symbols that mark a message as a math question.
const MATH_KEYWORDS: &[&str] = &[
    "数学", "计算", "方程", "加减乘除", "加法", "减法", "乘法", "除法", "代数", "几何", "三角",
    "函数", "微积分", "概率", "统计", "平方", "立方", "开方", "开根号", "+", "-", "*", "/", "=",
    "<", ">", "≠", "≤", "≥",
];

/// Returns the agent type that should answer `message` instead of an agent
/// of type `current`, if any. Only Chinese teachers hand off, and only math
/// questions.
pub fn detect_intent(current: AgentType, message: &str) -> Option<AgentType> {
    if current != AgentType::ChineseTeacher {
        return None;
    }
    MATH_KEYWORDS
        .iter()
        .any(|keyword| message.contains(keyword))
        .then_some(AgentType::MathTeacher)
}

/// Formats an answer produced by another agent on this agent's behalf.
pub fn forwarded_answer(agent_name: &str, answer: &str) -> String {
    format!("[{}回答] {}", agent_name, answer)
}
