//! Fixed instructions sent to the model.

/// Instruction paired with the page image on `/api/convert`.
pub const OCR_INSTRUCTION: &str = "Transcribe the image into LaTeX.\n\
Elements:\n\
- plain text\n\
- inline formulas ($...$)\n\
- standalone formulas (\\[ ... \\])\n\
\n\
Rules:\n\
- Preserve content and order exactly\n\
- Do NOT invent or solve anything\n\
- Output LaTeX only\n\
- No document headers or packages";

/// Leading block of every `/api/refactor` prompt. User instructions are
/// appended after it and cannot replace it. Kept in Russian: the endpoint
/// reworks Russian OCR output, pre-reform orthography included.
pub const REFACTOR_SYSTEM_BLOCK: &str = "Вы получили LaTeX текст, сгенерированный из OCR.\n\
Обязательные правила (не изменяйте):\n\
- Сохраняйте порядок и содержание текста полностью.\n\
- Не добавляйте новый контент.\n\
- Не пиши дополнительных ответов пользователю, строго по промту.\n\
- Не удаляйте информацию.\n\
- Сохраняйте язык оригинала, включая старорусские буквы и символы (ъ, i).\n\
- Форматирование LaTeX должно быть корректным.\n\
- Inline формулы остаются $...$, отдельные формулы остаются \\[ ... \\].\n\
- Заголовки и обычный текст сохраняются как есть (\\textbf будет удалено в пост-обработке).\n\n\
Пользовательский запрос:\n";

const TEXT_SECTION_HEADER: &str = "\n\nТекст для обработки:\n";

/// Assemble the refactor prompt: system block, user instruction, then the
/// text to rework.
pub fn refactor_prompt(instruction: &str, text: &str) -> String {
    let mut prompt = String::with_capacity(
        REFACTOR_SYSTEM_BLOCK.len() + instruction.len() + TEXT_SECTION_HEADER.len() + text.len(),
    );
    prompt.push_str(REFACTOR_SYSTEM_BLOCK);
    prompt.push_str(instruction);
    prompt.push_str(TEXT_SECTION_HEADER);
    prompt.push_str(text);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refactor_prompt_keeps_system_block_first() {
        let prompt = refactor_prompt("fix typos", "Some $x$ text");
        assert!(prompt.starts_with(REFACTOR_SYSTEM_BLOCK));
        assert!(prompt.ends_with(
            "Пользовательский запрос:\nfix typos\n\nТекст для обработки:\nSome $x$ text"
        ));
    }

    #[test]
    fn empty_instruction_still_separates_sections() {
        let prompt = refactor_prompt("", "body");
        assert!(prompt.ends_with("Пользовательский запрос:\n\n\nТекст для обработки:\nbody"));
    }

    #[test]
    fn refactor_block_keeps_pre_reform_rule() {
        assert!(REFACTOR_SYSTEM_BLOCK.starts_with("Вы получили LaTeX текст, сгенерированный из OCR.\n"));
        assert!(REFACTOR_SYSTEM_BLOCK.contains("старорусские буквы и символы (ъ, i)"));
        assert!(REFACTOR_SYSTEM_BLOCK.contains("отдельные формулы остаются \\[ ... \\]"));
        assert!(REFACTOR_SYSTEM_BLOCK.ends_with("\n\nПользовательский запрос:\n"));
    }

    #[test]
    fn ocr_instruction_forbids_headers() {
        assert!(OCR_INSTRUCTION.starts_with("Transcribe the image into LaTeX."));
        assert!(OCR_INSTRUCTION.contains("No document headers or packages"));
        assert!(OCR_INSTRUCTION.contains("\\[ ... \\]"));
    }
}
