use crate::blueprint::ChapterBlueprintEntry;
use crate::prompts::{keys, PromptArguments, PromptRegistry};

use super::{ChapterError, ChapterGuidance, ChapterStage, NextChapterFields};

pub struct FirstChapterContext<'a> {
    pub chapter_number: u32,
    pub word_number: u32,
    pub chapter: &'a ChapterBlueprintEntry,
    pub guidance: &'a ChapterGuidance,
    pub architecture: &'a str,
    pub volume_context: &'a str,
}

pub struct NextChapterContext<'a> {
    pub chapter_number: u32,
    pub word_number: u32,
    pub chapter: &'a ChapterBlueprintEntry,
    pub next: &'a NextChapterFields,
    pub guidance: &'a ChapterGuidance,
    pub global_summary: &'a str,
    pub previous_excerpt: &'a str,
    pub character_state: &'a str,
    pub short_summary: &'a str,
    pub volume_context: &'a str,
    pub filtered_context: &'a str,
}

pub fn render_first_chapter_prompt(
    prompts: &PromptRegistry,
    context: &FirstChapterContext<'_>,
) -> Result<String, ChapterError> {
    let mut args = current_chapter_arguments(
        context.chapter_number,
        context.word_number,
        context.chapter,
        context.guidance,
    );
    args.insert("novel_setting".into(), context.architecture.to_string());
    args.insert("volume_context".into(), context.volume_context.to_string());

    prompts
        .format(keys::FIRST_CHAPTER, &args)
        .map_err(|source| ChapterError::Prompt {
            stage: ChapterStage::Prompt,
            source,
        })
}

pub fn render_next_chapter_prompt(
    prompts: &PromptRegistry,
    context: &NextChapterContext<'_>,
) -> Result<String, ChapterError> {
    let mut args = current_chapter_arguments(
        context.chapter_number,
        context.word_number,
        context.chapter,
        context.guidance,
    );
    args.insert("global_summary".into(), context.global_summary.to_string());
    args.insert(
        "previous_chapter_excerpt".into(),
        context.previous_excerpt.to_string(),
    );
    args.insert("character_state".into(), context.character_state.to_string());
    args.insert("short_summary".into(), context.short_summary.to_string());
    args.insert("volume_context".into(), context.volume_context.to_string());
    args.insert("filtered_context".into(), context.filtered_context.to_string());
    context.next.insert_into(&mut args);

    prompts
        .format(keys::NEXT_CHAPTER, &args)
        .map_err(|source| ChapterError::Prompt {
            stage: ChapterStage::Prompt,
            source,
        })
}

fn current_chapter_arguments(
    chapter_number: u32,
    word_number: u32,
    chapter: &ChapterBlueprintEntry,
    guidance: &ChapterGuidance,
) -> PromptArguments {
    let mut args = PromptArguments::new();
    args.insert("novel_number".into(), chapter_number.to_string());
    args.insert("chapter_title".into(), chapter.chapter_title.clone());
    args.insert("chapter_role".into(), chapter.chapter_role.clone());
    args.insert("chapter_purpose".into(), chapter.chapter_purpose.clone());
    args.insert("suspense_level".into(), chapter.suspense_level.clone());
    args.insert("foreshadowing".into(), chapter.foreshadowing.clone());
    args.insert("plot_twist_level".into(), chapter.plot_twist_level.clone());
    args.insert("chapter_summary".into(), chapter.chapter_summary.clone());
    args.insert("word_number".into(), word_number.to_string());
    args.insert(
        "characters_involved".into(),
        guidance.characters_involved.clone(),
    );
    args.insert("key_items".into(), guidance.key_items.clone());
    args.insert("scene_location".into(), guidance.scene_location.clone());
    args.insert("time_constraint".into(), guidance.time_constraint.clone());
    args.insert(
        "user_guidance".into(),
        guidance.user_guidance_or_default().to_string(),
    );
    args
}
